/// Discovery types shared by every backend and the aggregator.
use std::fmt;

use crate::types::{Device, DeviceId};

// ── BackendKind ──────────────────────────────────────────────────────────

/// The closed set of discovery mechanisms.
///
/// Ordered by merge precedence: when two backends report the same device,
/// the later kind wins. `LocalAdvertisement` comes last because its
/// results carry a reachable address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BackendKind {
    SignalingRendezvous,
    LocalAdvertisement,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::SignalingRendezvous => "signaling-rendezvous",
            BackendKind::LocalAdvertisement => "local-advertisement",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── DiscoveryEvent ───────────────────────────────────────────────────────

/// Events emitted by a discovery backend (and forwarded unmodified by the
/// aggregator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Started,
    Stopped,
    /// A device appeared, or its metadata changed.
    DeviceFound(Device),
    DeviceLost(DeviceId),
    /// Discovery could not start or its underlying service broke.
    Failed(String),
    /// The local device is now advertised under this name.
    ServiceRegistered(String),
    ServiceRegistrationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_advertisement_sorts_last() {
        let mut kinds = vec![BackendKind::LocalAdvertisement, BackendKind::SignalingRendezvous];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![BackendKind::SignalingRendezvous, BackendKind::LocalAdvertisement]
        );
    }

    #[test]
    fn kind_display() {
        assert_eq!(BackendKind::LocalAdvertisement.to_string(), "local-advertisement");
    }
}
