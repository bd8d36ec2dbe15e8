//! Transport implementations.
//!
//! Concrete implementations of the domain-level [`Connector`] and
//! [`Link`](crate::Link) traits. The in-memory broker is always available;
//! AMQP sits behind the `transport_lapin` feature. Domain code must not
//! depend on transport-specific types.

mod memory;

#[cfg(feature = "transport_lapin")]
mod amqp;

pub use memory::{MemoryBroker, MemoryBrokerStats};

#[cfg(feature = "transport_lapin")]
pub use amqp::AmqpConnector;

use std::sync::Arc;

use crate::{BridgeConfig, BrokerUrl, ConnectorPtr, Result, Scheme};

/// Pick the connector implied by the URL scheme.
///
/// `memory://<name>` resolves to the process-wide [`MemoryBroker::named`]
/// instance, so every bridge using the same URL shares one broker.
///
/// # Errors
///
/// [`RpcError::Connection`](crate::RpcError::Connection) for `amqp`/`amqps`
/// when the crate is built without `transport_lapin`.
pub fn create_connector(url: &BrokerUrl, config: &BridgeConfig) -> Result<ConnectorPtr> {
    // ---
    match url.scheme() {
        Scheme::Memory => Ok(Arc::new(MemoryBroker::named(url.authority()))),

        #[cfg(feature = "transport_lapin")]
        Scheme::Amqp | Scheme::Amqps => Ok(Arc::new(AmqpConnector::new(config.prefetch))),

        #[cfg(not(feature = "transport_lapin"))]
        Scheme::Amqp | Scheme::Amqps => {
            let _ = config;
            Err(crate::RpcError::Connection(format!(
                "{url} requires the transport_lapin feature"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_memory_urls_share_a_broker() {
        // ---
        let config = BridgeConfig::memory("transport-shared", "q");
        let url = config.validate().unwrap();

        let a = create_connector(&url, &config).unwrap();
        let b = create_connector(&url, &config).unwrap();
        let _link_a = a.connect(&url).await.unwrap();
        let _link_b = b.connect(&url).await.unwrap();

        assert_eq!(MemoryBroker::named("transport-shared").connection_count(), 2);
    }

    #[cfg(not(feature = "transport_lapin"))]
    #[test]
    fn test_amqp_without_feature_is_rejected() {
        // ---
        let config = BridgeConfig::default();
        let url = config.validate().unwrap();

        assert!(matches!(
            create_connector(&url, &config),
            Err(crate::RpcError::Connection(_))
        ));
    }
}
