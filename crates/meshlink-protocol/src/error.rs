/// Errors for the MeshLink peer layer.
///
/// Wraps transport errors and adds discovery, registration and
/// configuration failures. Background tasks never return these; they
/// surface the same failures as typed events.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("transport error: {0}")]
    Transport(#[from] meshlink_transport::TransportError),

    #[error("{backend} discovery failed: {reason}")]
    Discovery {
        backend: &'static str,
        reason: String,
    },

    #[error("service registration failed: {0}")]
    Registration(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
