//! Channel/session layer.
//!
//! A [`Session`] is the logical path between the bridge and the broker. It:
//!
//! - publishes messages over the active link, serializing publishes so that
//!   messages sent through one session reach the broker in call order;
//! - remembers every queue declaration and subscription it has made and
//!   re-establishes them on each new link after a reconnect;
//! - drives one receive loop ("pump") per subscription, handing each
//!   delivery to a [`Consumer`] and acknowledging it afterwards.
//!
//! Publishes are never buffered: without an active link `publish` fails with
//! [`RpcError::NotConnected`] and the caller decides whether to retry.
//!
//! Declarations and subscriptions made while disconnected are recorded and
//! applied on the next link.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::{
    //
    lock_ignore_poison,
    log_debug,
    log_info,
    log_warn,
    ConnectionEvent,
    ConnectionManager,
    LinkPtr,
    Message,
    QueueOptions,
    Result,
    RpcError,
    SubscriptionHandle,
};

/// Receiver of inbound messages from a subscribed queue.
///
/// Returning an error does not stop the receive loop; the error is logged
/// and the delivery is still acknowledged.
#[async_trait::async_trait]
pub trait Consumer: Send + Sync {
    async fn on_message(&self, msg: Message) -> Result<()>;
}

pub type ConsumerPtr = Arc<dyn Consumer>;

struct QueueRecord {
    name: String,
    options: QueueOptions,
    declared_on: Option<String>,
}

struct SubscriptionRecord {
    queue: String,
    consumer: ConsumerPtr,
    active_on: Option<String>,
}

#[derive(Default)]
struct Topology {
    queues: Vec<QueueRecord>,
    subscriptions: Vec<SubscriptionRecord>,
}

struct Inner {
    connection: ConnectionManager,
    publish_lock: tokio::sync::Mutex<()>,
    topology: tokio::sync::Mutex<Topology>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Publish/consume session over a [`ConnectionManager`].
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Open a session and start following connection events.
    pub fn open(connection: ConnectionManager) -> Self {
        // ---
        let events = connection.events();
        let inner = Arc::new(Inner {
            connection,
            publish_lock: tokio::sync::Mutex::new(()),
            topology: tokio::sync::Mutex::new(Topology::default()),
            pumps: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        });

        let watcher = tokio::spawn(watch_connection(Arc::downgrade(&inner), events));
        *lock_ignore_poison(&inner.watcher) = Some(watcher);

        Self { inner }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Declare a queue. `durable` is passed through to the broker.
    ///
    /// # Errors
    ///
    /// Broker-side declaration failures are returned. While disconnected the
    /// declaration is recorded and `Ok(())` returned.
    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        self.declare(name, QueueOptions::durable(durable)).await
    }

    /// Declare a non-durable queue that the broker deletes once this
    /// process stops consuming it. Used for reply queues.
    pub async fn declare_ephemeral_queue(&self, name: &str) -> Result<()> {
        self.declare(name, QueueOptions::ephemeral()).await
    }

    async fn declare(&self, name: &str, options: QueueOptions) -> Result<()> {
        // ---
        let mut topology = self.inner.topology.lock().await;

        if !topology.queues.iter().any(|q| q.name == name) {
            topology.queues.push(QueueRecord {
                name: name.to_string(),
                options,
                declared_on: None,
            });
        }

        let Ok(link) = self.inner.connection.link() else {
            log_debug!("not connected, deferring declaration of {name}");
            return Ok(());
        };

        link.declare_queue(name, options).await?;
        if let Some(record) = topology.queues.iter_mut().find(|q| q.name == name) {
            record.declared_on = Some(link.link_id().to_string());
        }
        Ok(())
    }

    /// Publish a message to the queue named by its address.
    ///
    /// # Errors
    ///
    /// [`RpcError::NotConnected`] when there is no active link.
    pub async fn publish(&self, msg: Message) -> Result<()> {
        // ---
        let _ordered = self.inner.publish_lock.lock().await;
        let link = self.inner.connection.link()?;
        link.publish(msg).await
    }

    /// Consume `queue`, handing every delivery to `consumer`.
    ///
    /// The subscription survives reconnects.
    pub async fn subscribe(&self, queue: &str, consumer: ConsumerPtr) -> Result<()> {
        // ---
        let mut topology = self.inner.topology.lock().await;
        topology.subscriptions.push(SubscriptionRecord {
            queue: queue.to_string(),
            consumer: consumer.clone(),
            active_on: None,
        });

        let Ok(link) = self.inner.connection.link() else {
            log_debug!("not connected, deferring subscription to {queue}");
            return Ok(());
        };

        let handle = link.subscribe(queue).await?;
        self.inner.spawn_pump(link.clone(), queue, handle, consumer);

        if let Some(record) = topology.subscriptions.last_mut() {
            record.active_on = Some(link.link_id().to_string());
        }
        Ok(())
    }

    /// Stop every receive loop and forget the recorded topology.
    ///
    /// The underlying connection is left open.
    pub async fn close(&self) {
        // ---
        if let Some(watcher) = lock_ignore_poison(&self.inner.watcher).take() {
            watcher.abort();
        }
        for pump in lock_ignore_poison(&self.inner.pumps).drain(..) {
            pump.abort();
        }

        let mut topology = self.inner.topology.lock().await;
        topology.subscriptions.clear();
        topology.queues.clear();
    }
}

impl Inner {
    fn spawn_pump(
        &self,
        link: LinkPtr,
        queue: &str,
        mut handle: SubscriptionHandle,
        consumer: ConsumerPtr,
    ) {
        // ---
        let queue = queue.to_string();
        let pump = tokio::spawn(async move {
            log_debug!("consuming {queue} on {}", link.link_id());

            while let Some(delivery) = handle.inbox.recv().await {
                if let Err(e) = consumer.on_message(delivery.message).await {
                    log_warn!("consumer error on {queue}: {e}");
                }
                if let Err(e) = link.ack(delivery.tag).await {
                    log_debug!("ack of delivery {} on {queue} failed: {e}", delivery.tag);
                }
            }

            log_debug!("stopped consuming {queue} on {}", link.link_id());
        });

        let mut pumps = lock_ignore_poison(&self.pumps);
        pumps.retain(|p| !p.is_finished());
        pumps.push(pump);
    }

    /// Re-apply declarations and subscriptions not yet present on the
    /// current link.
    async fn restore(&self) -> Result<()> {
        // ---
        let mut topology = self.topology.lock().await;
        let link = self.connection.link()?;
        let link_id = link.link_id().to_string();

        for queue in topology.queues.iter_mut() {
            if queue.declared_on.as_deref() == Some(link_id.as_str()) {
                continue;
            }
            link.declare_queue(&queue.name, queue.options).await?;
            queue.declared_on = Some(link_id.clone());
        }

        let mut restored = 0;
        for sub in topology.subscriptions.iter_mut() {
            if sub.active_on.as_deref() == Some(link_id.as_str()) {
                continue;
            }
            let handle = link.subscribe(&sub.queue).await?;
            self.spawn_pump(link.clone(), &sub.queue, handle, sub.consumer.clone());
            sub.active_on = Some(link_id.clone());
            restored += 1;
        }

        log_info!("restored {restored} subscription(s) on {link_id}");
        Ok(())
    }
}

/// Follow connection events and restore topology after each reconnect.
async fn watch_connection(
    inner: Weak<Inner>,
    mut events: tokio::sync::broadcast::Receiver<ConnectionEvent>,
) {
    // ---
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            // Missed events may have included a reconnect; restore() is idempotent.
            Err(RecvError::Lagged(_)) => ConnectionEvent::Reconnected,
            Err(RecvError::Closed) => return,
        };

        match event {
            ConnectionEvent::Reconnected => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                match inner.restore().await {
                    Ok(()) => {}
                    Err(RpcError::NotConnected) => {
                        log_debug!("link lost again before topology was restored")
                    }
                    Err(e) => log_warn!("failed to restore topology: {e}"),
                }
            }
            ConnectionEvent::Closed => return,
            _ => {}
        }
    }
}
