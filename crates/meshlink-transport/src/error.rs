/// Errors returned by the MeshLink signaling transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),

    #[error("connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("connection to {url} timed out after {timeout_ms} ms")]
    ConnectTimeout { url: String, timeout_ms: u64 },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("send failed: {0}")]
    Send(String),

    #[error("signaling link is not connected")]
    NotConnected,

    #[error("connect attempt superseded by disconnect")]
    Cancelled,

    #[error("frame serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
