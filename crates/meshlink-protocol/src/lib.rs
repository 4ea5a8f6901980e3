//! MeshLink peer layer.
//!
//! Finds peers through LAN service advertisement and a rendezvous server,
//! merges both views into one peer list, tracks liveness from heartbeats
//! and re-establishes lost connections with capped exponential backoff.
//!
//! The signaling link itself lives in `meshlink-transport`; this crate
//! decides *when* and *with whom* to reconnect, never how bytes move.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use meshlink_protocol::{
//!     reconnect_fn, Device, DeviceType, DiscoveryAggregator, DiscoveryBackend, DiscoveryConfig,
//!     HeartbeatConfig, HeartbeatTracker, LocalAdvertisementBackend, ReconnectScheduler,
//!     SignalingRendezvousBackend,
//! };
//! use meshlink_transport::SignalingConfig;
//!
//! # async fn example() -> Result<(), meshlink_protocol::MeshError> {
//! let config = DiscoveryConfig::new().signaling_url("ws://192.168.1.20:8080/ws");
//! let lan: Arc<dyn DiscoveryBackend> = Arc::new(LocalAdvertisementBackend::mdns(&config)?);
//! let rendezvous: Arc<dyn DiscoveryBackend> =
//!     Arc::new(SignalingRendezvousBackend::websocket(SignalingConfig::new(), config));
//!
//! let discovery = DiscoveryAggregator::new(vec![rendezvous, lan]);
//! discovery
//!     .register_service(&Device::new("laptop-1", "Laptop", DeviceType::Desktop))
//!     .await?;
//! discovery.start_discovery().await?;
//!
//! let heartbeat = Arc::new(HeartbeatTracker::new(HeartbeatConfig::new()));
//! heartbeat.start();
//!
//! let scheduler = ReconnectScheduler::new(heartbeat);
//! scheduler.start(reconnect_fn(|device: Device| async move {
//!     println!("reconnecting to {}", device.device_id);
//!     Ok::<_, anyhow::Error>(())
//! }));
//! scheduler.watch_timeouts();
//! # Ok(())
//! # }
//! ```

pub use meshlink_transport::backoff;

pub mod config;
pub mod discovery;
pub mod error;
pub mod heartbeat;
pub mod reconnect;
pub mod types;

pub use config::{
    DiscoveryConfig, HeartbeatConfig, BASE_DELAY_MS, CONNECTION_TIMEOUT_MS,
    DEFAULT_REFRESH_INTERVAL, DEFAULT_SERVICE_PORT, DEFAULT_SERVICE_TYPE,
    DEFAULT_TRANSPORT_RETRY_DELAY, HEARTBEAT_INTERVAL_MS, MAX_RECONNECT_ATTEMPTS,
    MAX_RECONNECT_DELAY_MS,
};
pub use discovery::{
    merge_peer_lists, BackendKind, DeviceList, DiscoveryAggregator, DiscoveryBackend,
    DiscoveryEvent, LanServiceDiscovery, LocalAdvertisementBackend, MdnsServiceDiscovery,
    SignalingRendezvousBackend,
};
pub use error::MeshError;
pub use heartbeat::{ConnectionTimeout, HeartbeatRecord, HeartbeatTracker};
pub use reconnect::{
    reconnect_fn, ReconnectAction, ReconnectReason, ReconnectScheduler, ReconnectStatus,
    ReconnectStatusEvent, ReconnectTask,
};
pub use types::{
    now_ms, Device, DeviceId, DeviceStatus, DeviceType, MessageEnvelope, MessageType,
};
