//! Message print demo.
//!
//! One full-duplex bridge on the in-memory broker: a `message_print` handler
//! logs the text it receives and acknowledges it, and the same process sends
//! it a fire-and-forget message followed by a request.
//!
//! Run with `RUST_LOG=info cargo run --example message_print`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use mom_bridge::{BridgeBuilder, BridgeConfig, Result};

#[derive(Debug, Serialize, Deserialize)]
struct PrintRequest {
    text: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = BridgeConfig::memory("demo", "main_queue").with_request_timeout(Duration::from_secs(5));
    let bridge = BridgeBuilder::new(config).build().await?;

    bridge
        .dispatcher()?
        .register_handler("message_print", |req: PrintRequest| async move {
            tracing::info!(text = %req.text, "message_print");
            Ok::<_, String>(format!("Message printed: {}", req.text))
        });
    bridge.start().await?;

    let publisher = bridge.publisher()?;

    publisher
        .publish(
            "message_print",
            &PrintRequest {
                text: "fire and forget".into(),
            },
        )
        .await?;

    let ack: String = publisher
        .request_default(
            "message_print",
            &PrintRequest {
                text: "hello".into(),
            },
        )
        .await?;
    tracing::info!(%ack, "reply received");

    bridge.shutdown().await
}
