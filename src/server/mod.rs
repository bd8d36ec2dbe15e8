//! Inbound dispatch.
//!
//! The [`Dispatcher`] receives every message delivered on the work queue,
//! looks up a handler by exact routing key and runs it on its own task. The
//! number of handlers running at once is bounded by a semaphore. When the
//! inbound message carries a reply-to address and a correlation id, the
//! handler's outcome is published back as a reply (failure-marked when the
//! handler failed).
mod handler;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use handler::{HandlerFn, JsonHandler, RawHandler};

use crate::{
    //
    lock_ignore_poison,
    log_debug,
    log_warn,
    Consumer,
    Message,
    Result,
    RpcError,
    Session,
};

type HandlerRegistry = Mutex<HashMap<String, Arc<dyn HandlerFn>>>;

/// Snapshot of dispatch counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages handed to a registered handler.
    pub dispatched: u64,
    /// Messages dropped because no handler matched their routing key.
    pub no_handler: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Replies (success or failure-marked) published.
    pub replies_published: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    no_handler: AtomicU64,
    handler_failures: AtomicU64,
    replies_published: AtomicU64,
}

struct Inner {
    session: Session,
    handlers: HandlerRegistry,
    permits: Arc<Semaphore>,
    counters: Counters,
}

/// Routes inbound messages to handlers by routing key.
///
/// Cheap to clone; clones share the same registry.
///
/// # Example
///
/// ```no_run
/// use mom_bridge::{BridgeBuilder, BridgeConfig, BridgeMode};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Print { text: String }
///
/// # async fn example() -> mom_bridge::Result<()> {
/// let bridge = BridgeBuilder::new(BridgeConfig::memory("docs", "main_queue"))
///     .mode(BridgeMode::Consumer)
///     .build()
///     .await?;
///
/// bridge.dispatcher()?.register_handler("message_print", |req: Print| async move {
///     println!("{}", req.text);
///     Ok::<_, String>("ok".to_string())
/// });
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher that replies through `session` and runs at most
    /// `max_in_flight` handlers at once.
    pub fn new(session: Session, max_in_flight: usize) -> Self {
        // ---
        Self {
            inner: Arc::new(Inner {
                session,
                handlers: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
                counters: Counters::default(),
            }),
        }
    }

    /// Register a JSON handler for `routing_key`.
    ///
    /// The payload is decoded as `TReq`; the handler's `Ok` value is encoded
    /// as the reply payload and its `Err` value becomes the failure reason.
    /// Registering the same key again replaces the previous handler.
    pub fn register_handler<TReq, TResp, E, F, Fut>(&self, routing_key: &str, handler: F)
    where
        F: Fn(TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<TResp, E>> + Send + 'static,
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        self.insert(routing_key, Arc::new(JsonHandler::new(handler)));
    }

    /// Register a handler working on raw payload bytes.
    pub fn register_raw_handler<E, F, Fut>(&self, routing_key: &str, handler: F)
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Bytes, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.insert(routing_key, Arc::new(RawHandler::new(handler)));
    }

    /// Remove the handler for `routing_key`. Returns whether one existed.
    pub fn unregister(&self, routing_key: &str) -> bool {
        lock_ignore_poison(&self.inner.handlers).remove(routing_key).is_some()
    }

    pub fn has_handler(&self, routing_key: &str) -> bool {
        lock_ignore_poison(&self.inner.handlers).contains_key(routing_key)
    }

    pub fn stats(&self) -> DispatchStats {
        // ---
        let c = &self.inner.counters;
        DispatchStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            no_handler: c.no_handler.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            replies_published: c.replies_published.load(Ordering::Relaxed),
        }
    }

    fn insert(&self, routing_key: &str, handler: Arc<dyn HandlerFn>) {
        // ---
        let previous = lock_ignore_poison(&self.inner.handlers).insert(routing_key.to_string(), handler);
        if previous.is_some() {
            log_debug!("replaced handler for {routing_key}");
        }
    }
}

#[async_trait::async_trait]
impl Consumer for Dispatcher {
    async fn on_message(&self, msg: Message) -> Result<()> {
        // ---
        let handler = lock_ignore_poison(&self.inner.handlers)
            .get(msg.routing_key())
            .cloned();

        let Some(handler) = handler else {
            self.inner.counters.no_handler.fetch_add(1, Ordering::Relaxed);
            log_warn!("{}", RpcError::NoHandler(msg.routing_key().to_string()));
            return Ok(());
        };

        // Waits while the pool is full; the delivery stays unacked meanwhile.
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| RpcError::Cancelled)?;

        self.inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _permit = permit;

            // Run the handler on a task of its own so a panic ends up in the
            // JoinHandle instead of here.
            let payload = msg.payload().clone();
            let outcome = match tokio::spawn(async move { handler.call(payload).await }).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(RpcError::Handler("handler panicked".into())),
                Err(_) => Err(RpcError::Cancelled),
            };

            inner.complete(&msg, outcome).await;
        });

        Ok(())
    }
}

impl Inner {
    async fn complete(&self, request: &Message, outcome: Result<Bytes>) {
        // ---
        let key = request.routing_key();

        let reply = match outcome {
            Ok(payload) => Message::reply_ok(request, payload),
            Err(e) => {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                let reason = match e {
                    RpcError::Handler(reason) => reason,
                    other => other.to_string(),
                };
                log_warn!("handler for {key} failed: {reason}");
                Message::reply_err(request, reason)
            }
        };

        // Fire-and-forget messages get no reply.
        let Some(reply) = reply else {
            return;
        };

        match self.session.publish(reply).await {
            Ok(()) => {
                self.counters.replies_published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log_warn!("failed to publish reply for {key}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Address, ConnectionManager, CorrelationId, MemoryBroker, ReconnectPolicy};
    use serde::Deserialize;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Deserialize)]
    struct Print {
        text: String,
    }

    struct Collect(mpsc::UnboundedSender<Message>);

    #[async_trait::async_trait]
    impl Consumer for Collect {
        async fn on_message(&self, msg: Message) -> Result<()> {
            let _ = self.0.send(msg);
            Ok(())
        }
    }

    /// Session with a reply queue whose deliveries land in the returned receiver.
    async fn setup(name: &str) -> (Session, mpsc::UnboundedReceiver<Message>) {
        // ---
        let broker = MemoryBroker::new(name);
        let connection = ConnectionManager::connect(
            &format!("memory://{name}"),
            Arc::new(broker),
            ReconnectPolicy::default(),
        )
        .await
        .unwrap();
        let session = Session::open(connection);
        session.declare_queue("replies", false).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        session.subscribe("replies", Arc::new(Collect(tx))).await.unwrap();
        (session, rx)
    }

    fn request(key: &str, body: &'static [u8]) -> Message {
        Message::request(
            Address::from("work"),
            key,
            Bytes::from_static(body),
            CorrelationId::generate(),
            Address::from("replies"),
        )
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_reply_carries_correlation_id() {
        // ---
        let (session, mut rx) = setup("dispatch-reply").await;
        let dispatcher = Dispatcher::new(session, 4);
        dispatcher.register_handler("message_print", |req: Print| async move {
            assert_eq!(req.text, "hello");
            Ok::<_, String>("ok")
        });

        let req = request("message_print", br#"{"text":"hello"}"#);
        dispatcher.on_message(req.clone()).await.unwrap();

        let reply = next(&mut rx).await;
        assert_eq!(reply.correlation_id(), req.correlation_id());
        assert_eq!(reply.address().as_str(), "replies");
        assert_eq!(reply.payload().as_ref(), br#""ok""#);
        assert_eq!(reply.failure(), None);
    }

    #[tokio::test]
    async fn test_handler_error_sends_failure_reply() {
        // ---
        let (session, mut rx) = setup("dispatch-failure").await;
        let dispatcher = Dispatcher::new(session, 4);
        dispatcher.register_raw_handler("boom", |_: Bytes| async move { Err::<Bytes, _>("exploded") });

        dispatcher.on_message(request("boom", b"{}")).await.unwrap();

        let reply = next(&mut rx).await;
        assert_eq!(reply.failure(), Some("exploded"));
        assert_eq!(dispatcher.stats().handler_failures, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        // ---
        let (session, mut rx) = setup("dispatch-panic").await;
        let dispatcher = Dispatcher::new(session, 4);
        dispatcher.register_raw_handler("panic", |_: Bytes| async move {
            if true {
                panic!("handler bug");
            }
            Ok::<Bytes, String>(Bytes::new())
        });
        dispatcher.register_raw_handler("echo", |b: Bytes| async move { Ok::<_, String>(b) });

        dispatcher.on_message(request("panic", b"{}")).await.unwrap();
        let reply = next(&mut rx).await;
        assert_eq!(reply.failure(), Some("handler panicked"));

        dispatcher.on_message(request("echo", b"\"still alive\"")).await.unwrap();
        let reply = next(&mut rx).await;
        assert_eq!(reply.payload().as_ref(), b"\"still alive\"");
    }

    #[tokio::test]
    async fn test_unknown_key_is_dropped() {
        // ---
        let (session, mut rx) = setup("dispatch-nohandler").await;
        let dispatcher = Dispatcher::new(session, 4);
        dispatcher.register_raw_handler("echo", |b: Bytes| async move { Ok::<_, String>(b) });

        dispatcher.on_message(request("nobody_home", b"{}")).await.unwrap();
        dispatcher.on_message(request("echo", b"1")).await.unwrap();

        // Only the echo reply shows up.
        let reply = next(&mut rx).await;
        assert_eq!(reply.payload().as_ref(), b"1");

        let stats = dispatcher.stats();
        assert_eq!(stats.no_handler, 1);
        assert_eq!(stats.dispatched, 1);
    }

    #[tokio::test]
    async fn test_event_gets_no_reply() {
        // ---
        let (session, mut rx) = setup("dispatch-event").await;
        let dispatcher = Dispatcher::new(session, 4);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        dispatcher.register_raw_handler("log", move |b: Bytes| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(b);
                Ok::<_, String>(Bytes::new())
            }
        });

        let event = Message::event(Address::from("work"), "log", Bytes::from_static(b"x"));
        dispatcher.on_message(event).await.unwrap();

        timeout(Duration::from_secs(1), seen_rx.recv()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.stats().replies_published, 0);
    }

    #[tokio::test]
    async fn test_in_flight_handlers_are_bounded() {
        // ---
        let (session, _rx) = setup("dispatch-bounded").await;
        let dispatcher = Dispatcher::new(session, 2);
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        dispatcher.register_raw_handler("slow", move |_: Bytes| {
            let mut release_rx = release_rx.clone();
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                loop {
                    let released = *release_rx.borrow_and_update();
                    if released || release_rx.changed().await.is_err() {
                        break;
                    }
                }
                Ok::<_, String>(Bytes::new())
            }
        });

        dispatcher.on_message(request("slow", b"")).await.unwrap();
        dispatcher.on_message(request("slow", b"")).await.unwrap();

        // The third delivery waits for a free slot.
        let third = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.on_message(request("slow", b"")).await })
        };

        started_rx.recv().await.unwrap();
        started_rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!third.is_finished());

        release_tx.send_replace(true);
        timeout(Duration::from_secs(1), third).await.unwrap().unwrap().unwrap();
        timeout(Duration::from_secs(1), started_rx.recv()).await.unwrap().unwrap();
    }
}
