#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::broadcast;

use mom_bridge::{
    //
    Bridge,
    BridgeBuilder,
    BridgeConfig,
    BridgeMode,
    ConnectionEvent,
    MemoryBroker,
    ReconnectPolicy,
    Result,
};

static INIT: Once = Once::new();

/// Install a test-friendly subscriber once; `RUST_LOG` controls the level.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Reconnect quickly so failure tests stay fast.
pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        ..ReconnectPolicy::default()
    }
}

pub async fn bridge(broker: &MemoryBroker, node_id: &str, mode: BridgeMode) -> Result<Bridge> {
    // ---
    let config = BridgeConfig::memory(broker.name(), "main_queue")
        .with_node_id(node_id)
        .with_reconnect(fast_reconnect());

    BridgeBuilder::new(config)
        .mode(mode)
        .connector(Arc::new(broker.clone()))
        .build()
        .await
}

/// Wait for `wanted` on an event stream subscribed before the trigger.
pub async fn wait_for_event(events: &mut broadcast::Receiver<ConnectionEvent>, wanted: ConnectionEvent) {
    // ---
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if event == wanted => return,
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for connection event");
}

/// Poll `cond` until it holds or a second has passed.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    // ---
    tokio::time::timeout(Duration::from_secs(1), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
