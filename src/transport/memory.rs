// src/transport/memory.rs

//! In-memory broker.
//!
//! A pure in-process implementation of the [`Connector`] and [`Link`]
//! traits. It backs the test suite and defines the reference semantics the
//! broker-backed transports approximate:
//!
//! - Queues are point-to-point: each message is handed to exactly one
//!   consumer, round robin across the queue's consumers.
//! - A declared queue with no consumer buffers messages until one subscribes.
//! - Publishing to an undeclared queue drops the message (as the AMQP
//!   default exchange does for an unknown routing key).
//! - Messages published through one link are enqueued in call order.
//! - A delivery stays unacknowledged until [`Link::ack`]. When its link goes
//!   away the message is put back at the head of its queue and redelivered,
//!   as an AMQP broker does when a channel closes.
//! - Queues declared with `auto_delete` are removed once the link of their
//!   last consumer goes away.
//!
//! Failure injection: [`MemoryBroker::sever`] kills every live link,
//! [`MemoryBroker::restart`] additionally forgets non-durable queues, and
//! [`MemoryBroker::set_available`] makes new connection attempts fail.
//!
//! Persistence, exchanges and routing topologies are out of scope.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{mpsc, watch};

use crate::{
    //
    lock_ignore_poison,
    log_debug,
    log_info,
    BrokerUrl,
    Connector,
    Delivery,
    DeliveryTag,
    Link,
    LinkPtr,
    Message,
    QueueOptions,
    Result,
    RpcError,
    Scheme,
    SubscriptionHandle,
};

/// Counters exposed for assertions and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBrokerStats {
    pub published: u64,
    pub dropped: u64,
    pub acked: u64,
    /// Unacknowledged deliveries put back after their link went away.
    pub requeued: u64,
    pub connections: u64,
}

struct QueueConsumer {
    link_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    tags: Arc<AtomicU64>,
}

struct QueueState {
    options: QueueOptions,
    buffer: VecDeque<Message>,
    consumers: Vec<QueueConsumer>,
    cursor: usize,
    /// Delivered, not yet acked; keyed by (link, tag) so order is kept per link.
    unacked: BTreeMap<(u64, DeliveryTag), Message>,
    /// Whether anyone ever consumed; auto-delete only applies afterwards.
    consumed: bool,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            buffer: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            unacked: BTreeMap::new(),
            consumed: false,
        }
    }

    /// Hand `msg` to the next live consumer; give it back if there is none.
    fn deliver(&mut self, msg: Message) -> Option<Message> {
        // ---
        while !self.consumers.is_empty() {
            let idx = self.cursor % self.consumers.len();
            let consumer = &self.consumers[idx];
            let tag = consumer.tags.fetch_add(1, Ordering::Relaxed) + 1;

            let delivery = Delivery {
                tag,
                message: msg.clone(),
            };
            if consumer.tx.send(delivery).is_ok() {
                self.unacked.insert((consumer.link_id, tag), msg);
                self.cursor = idx + 1;
                return None;
            }

            // Inbox dropped: forget the consumer and try the next one.
            self.consumers.remove(idx);
        }
        Some(msg)
    }

    fn enqueue(&mut self, msg: Message) {
        if let Some(undelivered) = self.deliver(msg) {
            self.buffer.push_back(undelivered);
        }
    }

    fn flush(&mut self) {
        while let Some(msg) = self.buffer.pop_front() {
            if let Some(undelivered) = self.deliver(msg) {
                self.buffer.push_front(undelivered);
                break;
            }
        }
    }

    /// Put unacked deliveries of `link_id` (all links for `None`) back at
    /// the head of the buffer, oldest first.
    fn requeue(&mut self, link_id: Option<u64>) -> usize {
        // ---
        let keys: Vec<_> = self
            .unacked
            .keys()
            .filter(|(link, _)| link_id.map_or(true, |id| *link == id))
            .copied()
            .collect();

        let count = keys.len();
        for key in keys.into_iter().rev() {
            if let Some(msg) = self.unacked.remove(&key) {
                self.buffer.push_front(msg);
            }
        }
        count
    }

    fn is_abandoned(&self) -> bool {
        self.options.auto_delete && self.consumed && self.consumers.is_empty()
    }
}

struct BrokerState {
    name: String,
    queues: Mutex<HashMap<String, QueueState>>,
    links: Mutex<HashMap<u64, watch::Sender<bool>>>,
    available: AtomicBool,
    next_link: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
}

impl BrokerState {
    fn drop_link(&self, link_id: u64) {
        // ---
        if let Some(closed_tx) = lock_ignore_poison(&self.links).remove(&link_id) {
            let _ = closed_tx.send(true);
        }

        let mut queues = lock_ignore_poison(&self.queues);
        let mut requeued = 0;
        for queue in queues.values_mut() {
            queue.consumers.retain(|c| c.link_id != link_id);
            requeued += queue.requeue(Some(link_id));
            queue.flush();
        }
        queues.retain(|_, queue| !queue.is_abandoned());

        self.requeued.fetch_add(requeued as u64, Ordering::Relaxed);
    }
}

/// An in-process message broker.
///
/// Cheap to clone; clones share the same queues. Use
/// [`MemoryBroker::named`] to obtain the broker behind a `memory://<name>`
/// URL.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Create an isolated broker not reachable through the registry.
    pub fn new(name: impl Into<String>) -> Self {
        // ---
        Self {
            state: Arc::new(BrokerState {
                name: name.into(),
                queues: Mutex::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                next_link: AtomicU64::new(1),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                acked: AtomicU64::new(0),
                requeued: AtomicU64::new(0),
            }),
        }
    }

    /// The process-wide broker registered under `name`, created on first use.
    pub fn named(name: &str) -> Self {
        // ---
        static REGISTRY: OnceLock<Mutex<HashMap<String, MemoryBroker>>> = OnceLock::new();

        let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        lock_ignore_poison(registry)
            .entry(name.to_string())
            .or_insert_with(|| MemoryBroker::new(name))
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Allow or refuse new connections. Existing links are unaffected.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Kill every live link, as a network partition or broker crash would.
    ///
    /// Queues and their buffered messages survive, unacked deliveries are
    /// requeued, and auto-delete queues that lose their consumers go away.
    pub fn sever(&self) {
        // ---
        let links: Vec<_> = lock_ignore_poison(&self.state.links).drain().collect();
        for (_, closed_tx) in &links {
            let _ = closed_tx.send(true);
        }

        let mut queues = lock_ignore_poison(&self.state.queues);
        let mut requeued = 0;
        for queue in queues.values_mut() {
            queue.consumers.clear();
            requeued += queue.requeue(None);
        }
        queues.retain(|_, queue| !queue.is_abandoned());
        self.state.requeued.fetch_add(requeued as u64, Ordering::Relaxed);

        log_info!("[{}] severed {} link(s)", self.state.name, links.len());
    }

    /// Sever every link and forget non-durable queues.
    pub fn restart(&self) {
        // ---
        self.sever();
        lock_ignore_poison(&self.state.queues).retain(|_, queue| queue.options.durable);
    }

    /// Number of live links.
    pub fn connection_count(&self) -> usize {
        lock_ignore_poison(&self.state.links).len()
    }

    /// Messages buffered in `queue`, or `None` if it is not declared.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        lock_ignore_poison(&self.state.queues)
            .get(queue)
            .map(|q| q.buffer.len())
    }

    /// Live consumers of `queue`, or `None` if it is not declared.
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        lock_ignore_poison(&self.state.queues)
            .get(queue)
            .map(|q| q.consumers.iter().filter(|c| !c.tx.is_closed()).count())
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        lock_ignore_poison(&self.state.queues)
            .get(queue)
            .map(|q| q.options.durable)
    }

    /// Deliveries on `queue` still awaiting an ack.
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        lock_ignore_poison(&self.state.queues)
            .get(queue)
            .map(|q| q.unacked.len())
    }

    pub fn stats(&self) -> MemoryBrokerStats {
        // ---
        MemoryBrokerStats {
            published: self.state.published.load(Ordering::Relaxed),
            dropped: self.state.dropped.load(Ordering::Relaxed),
            acked: self.state.acked.load(Ordering::Relaxed),
            requeued: self.state.requeued.load(Ordering::Relaxed),
            connections: self.state.next_link.load(Ordering::Relaxed) - 1,
        }
    }

    /// Open a link directly, bypassing URL handling.
    pub fn open_link(&self) -> Result<LinkPtr> {
        // ---
        if !self.state.available.load(Ordering::SeqCst) {
            return Err(RpcError::Connection(format!(
                "memory broker `{}` is unavailable",
                self.state.name
            )));
        }

        let id = self.state.next_link.fetch_add(1, Ordering::Relaxed);
        let (closed_tx, closed_rx) = watch::channel(false);
        lock_ignore_poison(&self.state.links).insert(id, closed_tx);

        log_debug!("[{}] link {id} opened", self.state.name);

        Ok(Arc::new(MemoryLink {
            id,
            link_id: format!("{}#{id}", self.state.name),
            broker: Arc::clone(&self.state),
            closed_rx,
            tags: Arc::new(AtomicU64::new(0)),
        }))
    }
}

#[async_trait::async_trait]
impl Connector for MemoryBroker {
    // ---
    async fn connect(&self, url: &BrokerUrl) -> Result<LinkPtr> {
        // ---
        if url.scheme() != Scheme::Memory {
            return Err(RpcError::Connection(format!(
                "memory broker cannot serve `{url}`"
            )));
        }
        self.open_link()
    }
}

/// One connection to a [`MemoryBroker`].
struct MemoryLink {
    id: u64,
    link_id: String,
    broker: Arc<BrokerState>,
    closed_rx: watch::Receiver<bool>,
    tags: Arc<AtomicU64>,
}

impl MemoryLink {
    fn ensure_open(&self) -> Result<()> {
        if *self.closed_rx.borrow() {
            Err(RpcError::NotConnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Link for MemoryLink {
    // ---
    fn link_id(&self) -> &str {
        &self.link_id
    }

    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()> {
        // ---
        self.ensure_open()?;

        let mut queues = lock_ignore_poison(&self.broker.queues);
        let state = queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState::new(options));

        if state.options != options {
            return Err(RpcError::Transport(format!(
                "queue `{queue}` already declared with {:?}",
                state.options
            )));
        }
        Ok(())
    }

    async fn publish(&self, msg: Message) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.broker.published.fetch_add(1, Ordering::Relaxed);

        let mut queues = lock_ignore_poison(&self.broker.queues);
        match queues.get_mut(msg.address().as_str()) {
            Some(queue) => queue.enqueue(msg),
            None => {
                self.broker.dropped.fetch_add(1, Ordering::Relaxed);
                log_debug!(
                    "[{}] dropped message for undeclared queue {}",
                    self.link_id,
                    msg.address()
                );
            }
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<SubscriptionHandle> {
        // ---
        self.ensure_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut queues = lock_ignore_poison(&self.broker.queues);
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| RpcError::Transport(format!("queue `{queue}` not declared")))?;

        state.consumers.push(QueueConsumer {
            link_id: self.id,
            tx,
            tags: Arc::clone(&self.tags),
        });
        state.consumed = true;
        state.flush();

        Ok(SubscriptionHandle { inbox: rx })
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        // ---
        self.ensure_open()?;

        let key = (self.id, tag);
        let found = lock_ignore_poison(&self.broker.queues)
            .values_mut()
            .any(|queue| queue.unacked.remove(&key).is_some());

        if found {
            self.broker.acked.fetch_add(1, Ordering::Relaxed);
        } else {
            log_debug!("[{}] ack for unknown delivery tag {tag}", self.link_id);
        }
        Ok(())
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.broker.drop_link(self.id);
        log_debug!("[{}] link closed", self.link_id);
        Ok(())
    }
}
