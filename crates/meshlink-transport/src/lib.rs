//! MeshLink signaling transport.
//!
//! Owns the control-plane link to a rendezvous server: a socket
//! abstraction with a WebSocket implementation, and the connection state
//! machine that drives it through connect, automatic bounded reconnect and
//! manual disconnect.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use meshlink_transport::{SignalingConfig, SignalingConnection, SignalingConnectionEvent};
//!
//! # async fn example() -> Result<(), meshlink_transport::TransportError> {
//! let link = SignalingConnection::websocket(SignalingConfig::new());
//! let mut events = link.subscribe();
//!
//! link.connect_to_server("192.168.1.20:8080").await?;
//! link.send(r#"{"type":"get-peers"}"#).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let SignalingConnectionEvent::Message { text } = event {
//!         println!("server said {text}");
//!     }
//! }
//! link.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod backoff;
mod config;
mod connection;
mod error;
mod socket;

pub use backoff::{backoff_delay, backoff_delay_ms};
pub use config::{
    SignalingConfig, DEFAULT_BASE_RECONNECT_DELAY, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_MAX_RECONNECT_DELAY, DEFAULT_READ_TIMEOUT,
    DEFAULT_SIGNALING_PORT,
};
pub use connection::{
    resolve_target, ConnectionState, ServerTarget, SignalingConnection, SignalingConnectionEvent,
    MAX_RECONNECT_REACHED,
};
pub use error::TransportError;
pub use socket::{FrameSink, FrameStream, SignalingSocket, SignalingTransport, WsTransport};

#[cfg(any(test, feature = "test-utils"))]
pub use socket::mock;
