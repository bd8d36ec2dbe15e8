//! Connection manager.
//!
//! Owns the single live [`Link`](crate::Link) to the broker and keeps it
//! alive. A supervisor task watches the link's closed signal; when the link
//! dies without [`ConnectionManager::close`] having been called it:
//!
//! 1. clears the active link and moves to [`ConnectionState::Disconnected`],
//! 2. broadcasts [`ConnectionEvent::Disconnected`],
//! 3. reconnects with exponential backoff and jitter
//!    ([`ReconnectPolicy`]), broadcasting
//!    [`ConnectionEvent::Reconnecting`] before each attempt,
//! 4. installs the new link and broadcasts [`ConnectionEvent::Reconnected`].
//!
//! Only the supervisor replaces the active link. Publishers take a cloned
//! [`LinkPtr`] through [`ConnectionManager::link`] and never mutate
//! connection state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::retry::{apply_jitter, next_delay};
use crate::{
    //
    lock_ignore_poison,
    log_debug,
    log_error,
    log_info,
    log_warn,
    BrokerUrl,
    ConnectorPtr,
    LinkPtr,
    ReconnectPolicy,
    Result,
    RpcError,
};

/// Lifecycle state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The link died unexpectedly. Pending requests are invalid.
    Disconnected,
    /// About to attempt a reconnect after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// A new link is installed; subscriptions must be re-established.
    Reconnected,
    /// Reconnect attempts exhausted; the manager stays disconnected.
    GaveUp { attempts: u32 },
    /// The connection was closed on request.
    Closed,
}

const EVENT_CAPACITY: usize = 64;

struct Inner {
    url: BrokerUrl,
    connector: ConnectorPtr,
    policy: ReconnectPolicy,
    link: Mutex<Option<LinkPtr>>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events_tx.send(event);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Owner of the broker connection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Connect to the broker at `url` and start supervising the link.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Connection`] if the URL is malformed or the broker
    /// cannot be reached. No background reconnect is attempted in that case:
    /// a failure at startup is fatal.
    pub async fn connect(
        url: &str,
        connector: ConnectorPtr,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        // ---
        let url = BrokerUrl::parse(url)?;
        Self::connect_url(url, connector, policy).await
    }

    pub(crate) async fn connect_url(
        url: BrokerUrl,
        connector: ConnectorPtr,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        // ---
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        log_info!("connecting to broker {url}");

        let link = connector.connect(&url).await.map_err(|e| {
            log_error!("connection to {url} failed: {e}");
            match e {
                RpcError::Connection(_) => e,
                other => RpcError::Connection(other.to_string()),
            }
        })?;

        log_info!("connected to broker {url} ({})", link.link_id());

        let inner = Arc::new(Inner {
            url,
            connector,
            policy,
            link: Mutex::new(Some(link.clone())),
            state_tx,
            events_tx,
            shutdown_tx,
            supervisor: Mutex::new(None),
        });
        inner.set_state(ConnectionState::Connected);

        let handle = tokio::spawn(supervise(Arc::clone(&inner), link));
        *lock_ignore_poison(&inner.supervisor) = Some(handle);

        Ok(Self { inner })
    }

    /// The active link.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::NotConnected`] while disconnected or reconnecting.
    pub fn link(&self) -> Result<LinkPtr> {
        lock_ignore_poison(&self.inner.link)
            .clone()
            .ok_or(RpcError::NotConnected)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch channel tracking [`ConnectionState`] changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to connection lifecycle events.
    ///
    /// Only events emitted after this call are received.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn url(&self) -> &BrokerUrl {
        &self.inner.url
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        // ---
        if self.inner.shutdown_tx.send_replace(true) {
            return Ok(());
        }

        self.inner.set_state(ConnectionState::Closing);

        let link = lock_ignore_poison(&self.inner.link).take();
        let result = match link {
            Some(link) => link.close().await,
            None => Ok(()),
        };

        let supervisor = lock_ignore_poison(&self.inner.supervisor).take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.emit(ConnectionEvent::Closed);
        log_info!("connection to {} closed", self.inner.url);

        result
    }
}

/// Resolve once the flag is `true` or its sender is gone.
pub(crate) async fn wait_until_set(rx: &mut watch::Receiver<bool>) {
    // ---
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Supervisor loop: wait for the link to die, then reconnect.
async fn supervise(inner: Arc<Inner>, mut link: LinkPtr) {
    // ---
    let mut shutdown_rx = inner.shutdown_tx.subscribe();

    loop {
        let mut closed = link.closed();

        tokio::select! {
            _ = wait_until_set(&mut closed) => {}
            _ = wait_until_set(&mut shutdown_rx) => return,
        }

        if inner.is_shutting_down() {
            return;
        }

        log_warn!("link {} to {} lost", link.link_id(), inner.url);

        lock_ignore_poison(&inner.link).take();
        inner.set_state(ConnectionState::Disconnected);
        inner.emit(ConnectionEvent::Disconnected);

        match reconnect(&inner, &mut shutdown_rx).await {
            Some(new_link) => link = new_link,
            None => return,
        }
    }
}

/// Reconnect with backoff. Returns `None` on shutdown or when attempts run out.
async fn reconnect(inner: &Inner, shutdown_rx: &mut watch::Receiver<bool>) -> Option<LinkPtr> {
    // ---
    let policy = &inner.policy;
    let mut delay = policy.initial_delay;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        if let Some(max) = policy.max_attempts {
            if attempt > max {
                log_error!("giving up on {} after {max} reconnect attempts", inner.url);
                inner.emit(ConnectionEvent::GaveUp { attempts: max });
                return None;
            }
        }

        let jittered = apply_jitter(delay);
        inner.emit(ConnectionEvent::Reconnecting {
            attempt,
            delay: jittered,
        });
        log_debug!("reconnect attempt {attempt} to {} in {jittered:?}", inner.url);

        tokio::select! {
            _ = tokio::time::sleep(jittered) => {}
            _ = wait_until_set(shutdown_rx) => return None,
        }

        inner.set_state(ConnectionState::Connecting);

        match inner.connector.connect(&inner.url).await {
            Ok(link) => {
                if inner.is_shutting_down() {
                    let _ = link.close().await;
                    return None;
                }

                log_info!(
                    "reconnected to {} ({}) after {attempt} attempt(s)",
                    inner.url,
                    link.link_id()
                );
                *lock_ignore_poison(&inner.link) = Some(link.clone());
                inner.set_state(ConnectionState::Connected);
                inner.emit(ConnectionEvent::Reconnected);
                return Some(link);
            }
            Err(e) => {
                log_warn!("reconnect attempt {attempt} to {} failed: {e}", inner.url);
                inner.set_state(ConnectionState::Disconnected);
                delay = next_delay(delay, policy.multiplier, policy.max_delay);
            }
        }
    }
}
