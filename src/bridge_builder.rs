//! Bridge builder.
//!
//! Validates a [`BridgeConfig`], connects, and wires the session, publisher
//! and dispatcher for the chosen [`BridgeMode`].

use crate::{
    //
    log_info,
    transport,
    Address,
    Bridge,
    BridgeConfig,
    BridgeMode,
    ConnectionManager,
    ConnectorPtr,
    Dispatcher,
    Publisher,
    Result,
    Session,
};

/// Builder for [`Bridge`] instances.
///
/// # Examples
///
/// ## Full duplex on the in-memory broker
/// ```no_run
/// use mom_bridge::{BridgeBuilder, BridgeConfig};
///
/// # async fn example() -> mom_bridge::Result<()> {
/// let bridge = BridgeBuilder::new(BridgeConfig::memory("local", "main_queue"))
///     .build()
///     .await?;
/// bridge.start().await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Producer against RabbitMQ
/// ```no_run
/// use mom_bridge::{BridgeBuilder, BridgeConfig, BridgeMode, RetryConfig};
///
/// # async fn example() -> mom_bridge::Result<()> {
/// let config = BridgeConfig::new("amqp://localhost:5672", "main_queue")
///     .with_durable(true)
///     .with_retry(RetryConfig::default());
///
/// let bridge = BridgeBuilder::new(config)
///     .mode(BridgeMode::Producer)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct BridgeBuilder {
    // ---
    config: BridgeConfig,
    mode: BridgeMode,
    connector: Option<ConnectorPtr>,
}

impl BridgeBuilder {
    /// Create a builder in [`BridgeMode::FullDuplex`].
    pub fn new(config: BridgeConfig) -> Self {
        // ---
        Self {
            config,
            mode: BridgeMode::default(),
            connector: None,
        }
    }

    pub fn mode(mut self, mode: BridgeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Use `connector` instead of the one implied by the URL scheme.
    ///
    /// Handy for tests that hold on to a [`MemoryBroker`](crate::MemoryBroker).
    pub fn connector(mut self, connector: ConnectorPtr) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Validate the configuration, connect and wire everything up.
    ///
    /// The work queue is declared in every mode. Producers additionally
    /// declare and consume their reply queue. Consumers do not receive
    /// anything until [`Bridge::start`] is called, so handlers can be
    /// registered first.
    ///
    /// # Errors
    ///
    /// - [`RpcError::InvalidConfig`](crate::RpcError::InvalidConfig) for a bad configuration
    /// - [`RpcError::Connection`](crate::RpcError::Connection) if the broker is unreachable
    pub async fn build(self) -> Result<Bridge> {
        // ---
        let Self {
            config,
            mode,
            connector,
        } = self;

        let url = config.validate()?;
        let connector = match connector {
            Some(connector) => connector,
            None => transport::create_connector(&url, &config)?,
        };

        let connection = ConnectionManager::connect_url(url, connector, config.reconnect.clone()).await?;
        let session = Session::open(connection.clone());

        session.declare_queue(&config.queue_name, config.durable).await?;

        let publisher = if mode.publishes() {
            let reply_queue = config.reply_queue_name();
            // Reply queues belong to one process and never outlive it.
            session.declare_ephemeral_queue(&reply_queue).await?;

            let publisher = Publisher::new(
                session.clone(),
                Address::from(config.queue_name.as_str()),
                Address::from(reply_queue.as_str()),
                config.request_timeout,
                config.retry.clone(),
            );
            session.subscribe(&reply_queue, publisher.reply_consumer()).await?;
            Some(publisher)
        } else {
            None
        };

        let dispatcher = mode
            .consumes()
            .then(|| Dispatcher::new(session.clone(), config.max_in_flight_handlers));

        log_info!(
            "bridge {} ready in {mode} mode on queue {}",
            config.node_id,
            config.queue_name
        );

        Ok(Bridge::new(
            config,
            mode,
            connection,
            session,
            publisher,
            dispatcher,
        ))
    }
}
