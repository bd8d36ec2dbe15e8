//! Request/reply and fire-and-forget messaging over a broker-backed
//! point-to-point queue.
//!
//! A [`Bridge`] connects in-process callers (an HTTP layer, a CLI, a test) to
//! a message broker:
//!
//! - [`Publisher`] sends messages to the work queue and, for requests, waits
//!   on a correlation-id keyed slot until a reply, a timeout or a lost
//!   connection settles it;
//! - [`Dispatcher`] consumes the work queue, routes each message to a handler
//!   by routing key and publishes the handler's outcome back to the sender's
//!   reply queue;
//! - [`ConnectionManager`] keeps the broker link alive, reconnecting with
//!   exponential backoff, while [`Session`] restores queues and
//!   subscriptions after every reconnect.
//!
//! Brokers are reached through the [`Connector`]/[`Link`] traits. The
//! in-memory [`MemoryBroker`] is always available; AMQP 0-9-1 via `lapin`
//! is enabled with the `transport_lapin` feature.
//!
//! ```no_run
//! use mom_bridge::{BridgeBuilder, BridgeConfig};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Print { text: String }
//!
//! # async fn example() -> mom_bridge::Result<()> {
//! let bridge = BridgeBuilder::new(BridgeConfig::memory("local", "main_queue"))
//!     .build()
//!     .await?;
//!
//! bridge.dispatcher()?.register_handler("message_print", |req: Print| async move {
//!     Ok::<_, String>(format!("printed: {}", req.text))
//! });
//! bridge.start().await?;
//!
//! let ack: String = bridge
//!     .publisher()?
//!     .request("message_print", &Print { text: "hello".into() }, Duration::from_secs(5))
//!     .await?;
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod bridge;
mod bridge_builder;
mod bridge_mode;
mod client;
mod config;
mod connection;
mod correlation;
mod domain;
mod error;
mod macros;
mod retry;
mod server;
mod session;
mod transport;

use std::sync::{Mutex, MutexGuard};

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// --- public re-exports
pub use bridge::Bridge;
pub use bridge_builder::BridgeBuilder;
pub use bridge_mode::BridgeMode;

pub use client::{CorrelationTable, PendingRequest, Publisher};
pub use server::{DispatchStats, Dispatcher};

pub use config::{BridgeConfig, BrokerUrl, Scheme, DEFAULT_BROKER_URL, DEFAULT_QUEUE_NAME};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use correlation::CorrelationId;
pub use error::{Result, RpcError};
pub use retry::{ReconnectPolicy, RetryConfig};
pub use session::{Consumer, ConsumerPtr, Session};

pub use transport::{create_connector, MemoryBroker, MemoryBrokerStats};

#[cfg(feature = "transport_lapin")]
pub use transport::AmqpConnector;

pub use domain::{
    //
    Address,
    Connector,
    ConnectorPtr,
    Delivery,
    DeliveryTag,
    Link,
    LinkPtr,
    Message,
    QueueOptions,
    SubscriptionHandle,
    CONTENT_TYPE_JSON,
};

/// Acquire mutex guard, ignoring poisoning
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
