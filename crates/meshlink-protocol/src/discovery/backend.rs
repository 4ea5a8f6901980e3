use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::discovery::types::{BackendKind, DiscoveryEvent};
use crate::error::MeshError;
use crate::types::Device;

/// Peer list snapshot. Replaced wholesale on every change, never mutated.
pub type DeviceList = Arc<Vec<Device>>;

/// One discovery mechanism.
///
/// Operations that fail also emit the matching [`DiscoveryEvent`], so
/// callers that only watch the event stream see every failure.
#[async_trait::async_trait]
pub trait DiscoveryBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Begin discovering. Calling it while running is a no-op.
    async fn start_discovery(&self) -> Result<(), MeshError>;

    /// Stop discovering and emit `Stopped`. No-op if not running.
    async fn stop_discovery(&self);

    /// Advertise the local device.
    async fn register_service(&self, device: &Device) -> Result<(), MeshError>;

    /// Withdraw the local device.
    async fn unregister_service(&self);

    /// Current peer list, updated on every change.
    fn observe_discovered_devices(&self) -> watch::Receiver<DeviceList>;

    fn observe_discovery_events(&self) -> broadcast::Receiver<DiscoveryEvent>;

    fn is_discovering(&self) -> bool;
}
