//! Peer discovery.
//!
//! Two backends behind one [`DiscoveryBackend`] interface: LAN service
//! advertisement ([`LocalAdvertisementBackend`]) and a rendezvous server
//! ([`SignalingRendezvousBackend`]). [`DiscoveryAggregator`] merges them
//! into one peer list and one event stream.

pub mod aggregator;
pub mod backend;
pub mod local;
pub mod mdns;
pub mod rendezvous;
mod table;
pub mod types;

pub use aggregator::{merge_peer_lists, DiscoveryAggregator};
pub use backend::{DeviceList, DiscoveryBackend};
pub use local::{
    extract_device_id, instance_name_for, service_to_device, LanAdvert, LanEvent, LanService,
    LanServiceDiscovery, LocalAdvertisementBackend,
};
pub use mdns::MdnsServiceDiscovery;
pub use rendezvous::{ClientMessage, PeerPresence, ServerMessage, SignalingRendezvousBackend};
pub use types::{BackendKind, DiscoveryEvent};
