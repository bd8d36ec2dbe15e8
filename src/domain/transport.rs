// src/domain/transport.rs

//! Broker capability abstractions.
//!
//! The bridge depends on a broker only through two traits:
//!
//! - [`Connector`] establishes a connection to a broker URL and returns a
//!   [`Link`].
//! - [`Link`] is one live connection: declare queues, publish, subscribe,
//!   acknowledge deliveries, and report when the connection dies.
//!
//! Nothing here refers to a concrete wire protocol. Correlation, timeouts,
//! reconnects and dispatch are handled by the layers above. Concrete
//! implementations live under `src/transport/`; the in-memory broker is the
//! reference implementation of these semantics.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::{BrokerUrl, Message, Result};

/// Broker-assigned delivery tag, scoped to the link that delivered it.
pub type DeliveryTag = u64;

/// One inbound message awaiting acknowledgement.
#[derive(Debug)]
pub struct Delivery {
    /// Tag passed back to [`Link::ack`].
    pub tag: DeliveryTag,
    pub message: Message,
}

/// Handle returned from a successful [`Link::subscribe`].
///
/// The inbox yields deliveries until the link closes, at which point `recv()`
/// returns `None`.
pub struct SubscriptionHandle {
    // ---
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
}

/// Queue declaration parameters, forwarded to the broker untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Survive a broker restart.
    pub durable: bool,
    /// Delete the queue once its last consumer's link goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn durable(durable: bool) -> Self {
        Self {
            durable,
            auto_delete: false,
        }
    }

    /// Queue owned by one process, such as its reply queue.
    pub fn ephemeral() -> Self {
        Self {
            durable: false,
            auto_delete: true,
        }
    }
}

/// A live connection to a broker.
///
/// Implementations must ensure that:
/// - once `subscribe()` returns, messages subsequently published to that
///   queue are deliverable to the returned inbox;
/// - messages published through one link reach the broker in call order;
/// - the receiver returned by `closed()` flips to `true` exactly when the
///   connection is gone, whether through `close()` or a broker-side failure.
#[async_trait::async_trait]
pub trait Link: Send + Sync {
    // ---
    /// Identifier used in log lines.
    fn link_id(&self) -> &str;

    /// Declare a queue. Redeclaring with the same options is a no-op.
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()>;

    /// Publish a message to the queue named by its address.
    async fn publish(&self, msg: Message) -> Result<()>;

    /// Start consuming a queue.
    async fn subscribe(&self, queue: &str) -> Result<SubscriptionHandle>;

    /// Acknowledge a delivery received on this link.
    async fn ack(&self, tag: DeliveryTag) -> Result<()>;

    /// Watch channel reporting whether the link has closed.
    fn closed(&self) -> watch::Receiver<bool>;

    /// Close the link deliberately.
    async fn close(&self) -> Result<()>;
}

/// Shared link pointer.
pub type LinkPtr = Arc<dyn Link>;

/// Factory for broker links.
///
/// Called once at startup and again by the connection manager on every
/// reconnect attempt.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the broker.
    ///
    /// Unreachable brokers and rejected credentials are reported as
    /// [`RpcError::Connection`](crate::RpcError::Connection).
    async fn connect(&self, url: &BrokerUrl) -> Result<LinkPtr>;
}

/// Shared connector pointer.
pub type ConnectorPtr = Arc<dyn Connector>;
