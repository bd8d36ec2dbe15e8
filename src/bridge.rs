//! The assembled bridge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{
    //
    log_info,
    log_warn,
    BridgeConfig,
    BridgeMode,
    ConnectionManager,
    Dispatcher,
    Publisher,
    Result,
    RpcError,
    Session,
};

/// A connected bridge between in-process callers and the broker.
///
/// Built with [`BridgeBuilder`](crate::BridgeBuilder). Which halves are
/// available depends on the [`BridgeMode`]:
///
/// - [`publisher`](Self::publisher) for `Producer` and `FullDuplex`
/// - [`dispatcher`](Self::dispatcher) and [`start`](Self::start) for `Consumer` and `FullDuplex`
pub struct Bridge {
    // ---
    config: BridgeConfig,
    mode: BridgeMode,
    connection: ConnectionManager,
    session: Session,
    publisher: Option<Publisher>,
    dispatcher: Option<Dispatcher>,
    started: AtomicBool,
}

impl Bridge {
    pub(crate) fn new(
        config: BridgeConfig,
        mode: BridgeMode,
        connection: ConnectionManager,
        session: Session,
        publisher: Option<Publisher>,
        dispatcher: Option<Dispatcher>,
    ) -> Self {
        // ---
        Self {
            config,
            mode,
            connection,
            session,
            publisher,
            dispatcher,
            started: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> BridgeMode {
        self.mode
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Outbound facade.
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidMode`] in `Consumer` mode.
    pub fn publisher(&self) -> Result<&Publisher> {
        self.publisher.as_ref().ok_or_else(|| {
            RpcError::InvalidMode(format!("publisher() not allowed in {} mode", self.mode))
        })
    }

    /// Handler registry for the work queue.
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidMode`] in `Producer` mode.
    pub fn dispatcher(&self) -> Result<&Dispatcher> {
        self.dispatcher.as_ref().ok_or_else(|| {
            RpcError::InvalidMode(format!("dispatcher() not allowed in {} mode", self.mode))
        })
    }

    /// Start consuming the work queue.
    ///
    /// Register handlers before calling this; messages for unknown routing
    /// keys are dropped. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidMode`] in `Producer` mode.
    pub async fn start(&self) -> Result<()> {
        // ---
        let dispatcher = self.dispatcher()?.clone();

        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let queue = &self.config.queue_name;
        if let Err(e) = self.session.subscribe(queue, Arc::new(dispatcher)).await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        log_info!("consuming {queue}");
        Ok(())
    }

    /// Shut the bridge down.
    ///
    /// Cancels outstanding requests, stops every receive loop and closes the
    /// connection. A `Closed` event is emitted to connection subscribers.
    pub async fn shutdown(&self) -> Result<()> {
        // ---
        log_info!("shutting down bridge {}", self.config.node_id);

        if let Some(publisher) = &self.publisher {
            publisher.shutdown();
        }
        self.session.close().await;

        if let Err(e) = self.connection.close().await {
            log_warn!("error closing connection: {e}");
            return Err(e);
        }
        Ok(())
    }
}
