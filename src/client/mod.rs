//! Outbound side: fire-and-forget publishing and request/reply.
mod pending;

pub use pending::{CorrelationTable, PendingRequest};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::retry::retry_with_backoff;
use crate::{
    //
    lock_ignore_poison,
    log_debug,
    log_warn,
    Address,
    ConnectionEvent,
    ConnectionState,
    Consumer,
    ConsumerPtr,
    Message,
    Result,
    RetryConfig,
    Session,
};

struct Inner {
    session: Session,
    table: Arc<CorrelationTable>,
    target: Address,
    reply_to: Address,
    default_timeout: Duration,
    retry: Option<RetryConfig>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Publisher facade.
///
/// Sends fire-and-forget messages and requests to one target queue. Replies
/// come back on this process's reply queue, which must be consumed by the
/// [`ConsumerPtr`] returned from [`reply_consumer`](Self::reply_consumer).
/// When the connection drops, every outstanding request fails with
/// [`RpcError::ConnectionLost`](crate::RpcError::ConnectionLost).
///
/// # Example
///
/// ```no_run
/// use mom_bridge::{BridgeBuilder, BridgeConfig, BridgeMode};
/// use serde::Serialize;
/// use std::time::Duration;
///
/// #[derive(Serialize)]
/// struct Print { text: String }
///
/// # async fn example() -> mom_bridge::Result<()> {
/// let bridge = BridgeBuilder::new(BridgeConfig::memory("docs", "main_queue"))
///     .mode(BridgeMode::Producer)
///     .build()
///     .await?;
///
/// let ack: String = bridge
///     .publisher()?
///     .request("message_print", &Print { text: "hello".into() }, Duration::from_secs(5))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

impl Publisher {
    /// Create a publisher sending to `target` and expecting replies on `reply_to`.
    pub fn new(
        session: Session,
        target: Address,
        reply_to: Address,
        default_timeout: Duration,
        retry: Option<RetryConfig>,
    ) -> Self {
        // ---
        let table = Arc::new(CorrelationTable::new());
        let watcher = tokio::spawn(fail_on_disconnect(
            session.connection().events(),
            session.connection().watch_state(),
            Arc::clone(&table),
        ));

        Self {
            inner: Arc::new(Inner {
                session,
                table,
                target,
                reply_to,
                default_timeout,
                retry,
                watcher: Mutex::new(Some(watcher)),
            }),
        }
    }

    /// Consumer to subscribe on the reply queue.
    pub fn reply_consumer(&self) -> ConsumerPtr {
        Arc::new(ReplyConsumer {
            table: Arc::clone(&self.inner.table),
        })
    }

    pub fn target(&self) -> &Address {
        &self.inner.target
    }

    pub fn reply_to(&self) -> &Address {
        &self.inner.reply_to
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.table.len()
    }

    /// Publish a JSON payload without expecting a reply.
    ///
    /// Success means the broker accepted the message, nothing more.
    ///
    /// # Errors
    ///
    /// [`RpcError::NotConnected`](crate::RpcError::NotConnected) when there is
    /// no active link and retries (if configured) are exhausted.
    pub async fn publish<T: Serialize>(&self, routing_key: &str, payload: &T) -> Result<()> {
        let bytes = Bytes::from(serde_json::to_vec(payload)?);
        self.publish_bytes(routing_key, bytes).await
    }

    pub async fn publish_bytes(&self, routing_key: &str, payload: Bytes) -> Result<()> {
        // ---
        let msg = Message::event(self.inner.target.clone(), routing_key, payload);
        self.send(msg).await
    }

    /// Send a request and wait for the decoded reply.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Timeout`](crate::RpcError::Timeout) if no reply arrives within `timeout`
    /// - [`RpcError::ConnectionLost`](crate::RpcError::ConnectionLost) if the connection drops first
    /// - [`RpcError::Handler`](crate::RpcError::Handler) with the remote failure reason
    pub async fn request<TReq, TResp>(
        &self,
        routing_key: &str,
        payload: &TReq,
        timeout: Duration,
    ) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let reply = self.begin_request(routing_key, payload, timeout).await?.wait().await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// [`request`](Self::request) with the configured default timeout.
    pub async fn request_default<TReq, TResp>(&self, routing_key: &str, payload: &TReq) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        self.request(routing_key, payload, self.inner.default_timeout).await
    }

    pub async fn request_bytes(&self, routing_key: &str, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        self.begin_request_bytes(routing_key, payload, timeout).await?.wait().await
    }

    /// Send a request and return its handle without waiting.
    ///
    /// Dropping the handle cancels the request.
    pub async fn begin_request<T: Serialize>(
        &self,
        routing_key: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<PendingRequest> {
        let bytes = Bytes::from(serde_json::to_vec(payload)?);
        self.begin_request_bytes(routing_key, bytes, timeout).await
    }

    pub async fn begin_request_bytes(
        &self,
        routing_key: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<PendingRequest> {
        // ---
        // Registered before publishing so a fast reply always finds its slot.
        let pending = self.inner.table.register(timeout);

        let msg = Message::request(
            self.inner.target.clone(),
            routing_key,
            payload,
            pending.id().clone(),
            self.inner.reply_to.clone(),
        );

        // On failure `pending` is dropped here, which removes the entry.
        self.send(msg).await?;

        log_debug!("request {} sent with key {routing_key}", pending.id());
        Ok(pending)
    }

    /// Stop watching the connection and cancel every outstanding request.
    pub fn shutdown(&self) {
        // ---
        if let Some(watcher) = lock_ignore_poison(&self.inner.watcher).take() {
            watcher.abort();
        }
        let cancelled = self.inner.table.cancel_all();
        if cancelled > 0 {
            log_debug!("cancelled {cancelled} pending request(s) on shutdown");
        }
    }

    async fn send(&self, msg: Message) -> Result<()> {
        // ---
        let session = &self.inner.session;
        retry_with_backoff(self.inner.retry.as_ref(), move || session.publish(msg.clone())).await
    }
}

/// Settles pending requests from messages arriving on the reply queue.
struct ReplyConsumer {
    table: Arc<CorrelationTable>,
}

#[async_trait::async_trait]
impl Consumer for ReplyConsumer {
    async fn on_message(&self, msg: Message) -> Result<()> {
        // ---
        let Some(id) = msg.correlation_id().cloned() else {
            log_warn!("reply without correlation id on {}", msg.address());
            return Ok(());
        };

        let settled = match msg.failure() {
            Some(reason) => self.table.reject(&id, reason),
            None => self.table.resolve(&id, msg.into_payload()),
        };

        if !settled {
            log_debug!("ignored late or duplicate reply {id}");
        }
        Ok(())
    }
}

/// Fail every pending request as soon as the connection is lost.
async fn fail_on_disconnect(
    mut events: tokio::sync::broadcast::Receiver<ConnectionEvent>,
    state: tokio::sync::watch::Receiver<ConnectionState>,
    table: Arc<CorrelationTable>,
) {
    // ---
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Disconnected) => {
                let failed = table.fail_all();
                if failed > 0 {
                    log_warn!("connection lost, failed {failed} pending request(s)");
                }
            }
            Ok(ConnectionEvent::Closed) | Err(RecvError::Closed) => return,
            Ok(_) => {}
            // A missed Disconnected still shows in the current state.
            Err(RecvError::Lagged(_)) => {
                if *state.borrow() != ConnectionState::Connected {
                    table.fail_all();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{ConnectionManager, MemoryBroker, ReconnectPolicy, RpcError};

    async fn publisher(name: &str, retry: Option<RetryConfig>) -> (MemoryBroker, Publisher) {
        // ---
        let broker = MemoryBroker::new(name);
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            ..ReconnectPolicy::default()
        };
        let connection =
            ConnectionManager::connect(&format!("memory://{name}"), Arc::new(broker.clone()), policy)
                .await
                .unwrap();
        let session = Session::open(connection);
        session.declare_queue("work", false).await.unwrap();
        session.declare_queue("replies", false).await.unwrap();

        let publisher = Publisher::new(
            session.clone(),
            Address::from("work"),
            Address::from("replies"),
            Duration::from_secs(5),
            retry,
        );
        session.subscribe("replies", publisher.reply_consumer()).await.unwrap();
        (broker, publisher)
    }

    #[tokio::test]
    async fn test_publish_reaches_target_queue() {
        // ---
        let (broker, publisher) = publisher("publisher-event", None).await;

        publisher.publish("message_print", &serde_json::json!({"text": "hi"})).await.unwrap();

        assert_eq!(broker.queue_depth("work"), Some(1));
        assert_eq!(publisher.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_leaves_no_pending_entry() {
        // ---
        let (broker, publisher) = publisher("publisher-offline", None).await;
        broker.set_available(false);
        broker.sever();

        let mut state = publisher.inner.session.connection().watch_state();
        let _ = state.wait_for(|s| *s != ConnectionState::Connected).await;

        let result = publisher
            .request_bytes("message_print", Bytes::from_static(b"{}"), Duration::from_secs(1))
            .await;

        assert!(matches!(result, Err(RpcError::NotConnected)));
        assert_eq!(publisher.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_reply_consumer_rejects_failure_replies() {
        // ---
        let (_broker, publisher) = publisher("publisher-reject", None).await;
        let pending = publisher
            .begin_request_bytes("k", Bytes::new(), Duration::from_secs(5))
            .await
            .unwrap();

        let request = Message::request(
            Address::from("work"),
            "k",
            Bytes::new(),
            pending.id().clone(),
            Address::from("replies"),
        );
        let reply = Message::reply_err(&request, "nope").unwrap();
        publisher.reply_consumer().on_message(reply).await.unwrap();

        assert!(matches!(pending.wait().await, Err(RpcError::Handler(r)) if r == "nope"));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        // ---
        let (_broker, publisher) = publisher("publisher-shutdown", None).await;
        let pending = publisher
            .begin_request_bytes("k", Bytes::new(), Duration::from_secs(5))
            .await
            .unwrap();

        publisher.shutdown();

        assert!(matches!(pending.wait().await, Err(RpcError::Cancelled)));
        assert_eq!(publisher.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_retry_rides_out_short_outage() {
        // ---
        let retry = RetryConfig {
            max_attempts: 20,
            multiplier: 1.0,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(20),
        };
        let (broker, publisher) = publisher("publisher-retry", Some(retry)).await;

        broker.set_available(false);
        broker.sever();
        let outage = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            outage.set_available(true);
        });

        publisher.publish_bytes("k", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(broker.queue_depth("work"), Some(1));
    }
}
