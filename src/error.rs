use thiserror::Error;

/// Errors produced by the bridge.
///
/// Publish-side failures are returned to the caller directly. Consume-side
/// failures (`NoHandler`, handler errors without a reply address) are logged
/// by the dispatcher and never returned from the receive loop.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Broker unreachable, authentication rejected or malformed broker URL.
    #[error("connection error: {0}")]
    Connection(String),

    /// No active connection; the caller may retry.
    #[error("not connected to broker")]
    NotConnected,

    /// Request exceeded its deadline without a reply.
    #[error("request timed out")]
    Timeout,

    /// In-flight request invalidated by a broker disconnect.
    #[error("connection lost while request was pending")]
    ConnectionLost,

    /// The remote handler returned a failure.
    #[error("handler error: {0}")]
    Handler(String),

    /// No handler registered for the routing key.
    #[error("no handler registered for routing key: {0}")]
    NoHandler(String),

    /// The pending request was cancelled before it resolved.
    #[error("request cancelled")]
    Cancelled,

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration rejected at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not valid for the bridge's configured mode.
    #[error("invalid mode: {0}")]
    InvalidMode(String),

    /// Transport-level failure not covered by the variants above.
    #[error("transport error: {0}")]
    Transport(String),
}

impl RpcError {
    /// Whether repeating the failed publish may succeed.
    ///
    /// Only `NotConnected` qualifies: the connection manager is expected to
    /// restore the link in the background.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::NotConnected)
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, RpcError>;
