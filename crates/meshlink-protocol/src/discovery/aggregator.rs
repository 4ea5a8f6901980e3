/// DiscoveryAggregator: one peer list and one event stream over every
/// configured backend.
///
/// The merged list is recomputed whenever any backend publishes a new
/// snapshot. Backend snapshots are only read, never mutated. Events are
/// forwarded as they arrive, without de-duplication.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::discovery::backend::{DeviceList, DiscoveryBackend};
use crate::discovery::types::{BackendKind, DiscoveryEvent};
use crate::error::MeshError;
use crate::types::{Device, DeviceId};

const EVENT_CAPACITY: usize = 256;

/// Merge backend snapshots by device id.
///
/// Lists are applied in [`BackendKind`] order, so for an id reported by
/// several backends the highest kind wins (`LocalAdvertisement`, which
/// carries an address). The result is sorted by id.
pub fn merge_peer_lists(lists: &[(BackendKind, DeviceList)]) -> Vec<Device> {
    let mut ordered: Vec<&(BackendKind, DeviceList)> = lists.iter().collect();
    ordered.sort_by_key(|entry| entry.0);

    let mut merged: BTreeMap<DeviceId, Device> = BTreeMap::new();
    for (_, devices) in ordered {
        for device in devices.iter() {
            merged.insert(device.device_id.clone(), device.clone());
        }
    }
    merged.into_values().collect()
}

/// Latest snapshot per backend, indexed like the backend list.
struct MergeState {
    lists: Mutex<Vec<(BackendKind, DeviceList)>>,
    merged: watch::Sender<DeviceList>,
}

impl MergeState {
    fn update(&self, index: usize, devices: DeviceList) {
        let mut lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        lists[index].1 = devices;
        let next = merge_peer_lists(&lists);
        self.merged.send_if_modified(|current| {
            if current.as_slice() == next.as_slice() {
                return false;
            }
            *current = Arc::new(next);
            true
        });
    }
}

async fn watch_backend(
    state: Arc<MergeState>,
    index: usize,
    kind: BackendKind,
    mut devices: watch::Receiver<DeviceList>,
) {
    while devices.changed().await.is_ok() {
        let snapshot = devices.borrow_and_update().clone();
        tracing::debug!("aggregator: {kind} now reports {} devices", snapshot.len());
        state.update(index, snapshot);
    }
}

async fn forward_events(
    kind: BackendKind,
    mut events: broadcast::Receiver<DiscoveryEvent>,
    out: broadcast::Sender<DiscoveryEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let _ = out.send(event);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("aggregator: dropped {n} events from {kind}");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Fans operations out to every backend and merges what they report.
pub struct DiscoveryAggregator {
    backends: Vec<Arc<dyn DiscoveryBackend>>,
    state: Arc<MergeState>,
    events: broadcast::Sender<DiscoveryEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryAggregator {
    /// Subscribe to `backends`. Must be called inside a tokio runtime.
    pub fn new(backends: Vec<Arc<dyn DiscoveryBackend>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut receivers = Vec::with_capacity(backends.len());
        let mut lists = Vec::with_capacity(backends.len());
        for backend in &backends {
            let mut rx = backend.observe_discovered_devices();
            lists.push((backend.kind(), rx.borrow_and_update().clone()));
            receivers.push(rx);
        }
        let (merged, _) = watch::channel(Arc::new(merge_peer_lists(&lists)));
        let state = Arc::new(MergeState {
            lists: Mutex::new(lists),
            merged,
        });

        let mut tasks = Vec::with_capacity(backends.len() * 2);
        for (index, (backend, rx)) in backends.iter().zip(receivers).enumerate() {
            let kind = backend.kind();
            tasks.push(tokio::spawn(watch_backend(state.clone(), index, kind, rx)));
            tasks.push(tokio::spawn(forward_events(
                kind,
                backend.observe_discovery_events(),
                events.clone(),
            )));
        }

        Self {
            backends,
            state,
            events,
            tasks,
        }
    }

    pub fn backends(&self) -> &[Arc<dyn DiscoveryBackend>] {
        &self.backends
    }

    /// Start every backend. A backend that fails is logged and skipped;
    /// the call fails only if all of them did.
    pub async fn start_discovery(&self) -> Result<(), MeshError> {
        let results = join_all(self.backends.iter().map(|b| b.start_discovery())).await;
        self.settle("start discovery", results)
    }

    pub async fn stop_discovery(&self) {
        join_all(self.backends.iter().map(|b| b.stop_discovery())).await;
    }

    /// Advertise `device` through every backend, with the same failure
    /// rule as [`start_discovery`](Self::start_discovery).
    pub async fn register_service(&self, device: &Device) -> Result<(), MeshError> {
        let results = join_all(self.backends.iter().map(|b| b.register_service(device))).await;
        self.settle("register", results)
    }

    pub async fn unregister_service(&self) {
        join_all(self.backends.iter().map(|b| b.unregister_service())).await;
    }

    fn settle(&self, what: &str, results: Vec<Result<(), MeshError>>) -> Result<(), MeshError> {
        let mut first_error = None;
        let mut succeeded = results.is_empty();
        for (backend, result) in self.backends.iter().zip(results) {
            match result {
                Ok(()) => succeeded = true,
                Err(e) => {
                    tracing::warn!("aggregator: {} {what} failed: {e}", backend.kind());
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if !succeeded => Err(e),
            _ => Ok(()),
        }
    }

    /// Merged peer list, updated on every upstream change.
    pub fn observe_discovered_devices(&self) -> watch::Receiver<DeviceList> {
        self.state.merged.subscribe()
    }

    /// Union of every backend's events.
    pub fn observe_discovery_events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn is_discovering(&self) -> bool {
        self.backends.iter().any(|b| b.is_discovering())
    }

    pub fn current_devices(&self) -> DeviceList {
        self.state.merged.borrow().clone()
    }

    pub fn device(&self, device_id: &DeviceId) -> Option<Device> {
        self.state
            .merged
            .borrow()
            .iter()
            .find(|d| &d.device_id == device_id)
            .cloned()
    }
}

impl Drop for DiscoveryAggregator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::discovery::local::mock::{service, MockLanDiscovery};
    use crate::discovery::local::{LanEvent, LocalAdvertisementBackend};
    use crate::discovery::table::DeviceTable;
    use crate::types::DeviceType;

    /// Backend driven directly through its table.
    struct FakeBackend {
        kind: BackendKind,
        table: DeviceTable,
        fail: AtomicBool,
        discovering: AtomicBool,
    }

    impl FakeBackend {
        fn new(kind: BackendKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                table: DeviceTable::new(),
                fail: AtomicBool::new(false),
                discovering: AtomicBool::new(false),
            })
        }

        fn failing(kind: BackendKind) -> Arc<Self> {
            let backend = Self::new(kind);
            backend.fail.store(true, Ordering::SeqCst);
            backend
        }

        fn check(&self) -> Result<(), MeshError> {
            if self.fail.load(Ordering::SeqCst) {
                self.table.emit(DiscoveryEvent::Failed("fake".into()));
                return Err(MeshError::Discovery {
                    backend: "fake",
                    reason: "down".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl DiscoveryBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn start_discovery(&self) -> Result<(), MeshError> {
            self.check()?;
            self.discovering.store(true, Ordering::SeqCst);
            self.table.emit(DiscoveryEvent::Started);
            Ok(())
        }

        async fn stop_discovery(&self) {
            self.discovering.store(false, Ordering::SeqCst);
            self.table.emit(DiscoveryEvent::Stopped);
        }

        async fn register_service(&self, _device: &Device) -> Result<(), MeshError> {
            self.check()
        }

        async fn unregister_service(&self) {}

        fn observe_discovered_devices(&self) -> watch::Receiver<DeviceList> {
            self.table.subscribe_devices()
        }

        fn observe_discovery_events(&self) -> broadcast::Receiver<DiscoveryEvent> {
            self.table.subscribe_events()
        }

        fn is_discovering(&self) -> bool {
            self.discovering.load(Ordering::SeqCst)
        }
    }

    fn device(id: &str) -> Device {
        Device::new(id, id, DeviceType::Mobile)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn merge_prefers_local_advertisement() {
        let rendezvous: DeviceList = Arc::new(vec![device("a"), device("b")]);
        let lan: DeviceList = Arc::new(vec![device("a").with_address("192.168.1.7:47800")]);

        // Input order does not matter, only the kind does.
        let merged = merge_peer_lists(&[
            (BackendKind::LocalAdvertisement, lan),
            (BackendKind::SignalingRendezvous, rendezvous),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].address.as_deref(), Some("192.168.1.7:47800"));
        assert_eq!(merged[1], device("b"));
    }

    #[test]
    fn merge_of_nothing_is_empty() {
        assert!(merge_peer_lists(&[]).is_empty());
    }

    #[tokio::test]
    async fn merged_list_follows_backends() {
        let signaling = FakeBackend::new(BackendKind::SignalingRendezvous);
        let lan = FakeBackend::new(BackendKind::LocalAdvertisement);
        signaling.table.upsert(device("early"));

        let aggregator = DiscoveryAggregator::new(vec![signaling.clone(), lan.clone()]);
        assert_eq!(aggregator.current_devices().len(), 1);

        let mut merged = aggregator.observe_discovered_devices();
        signaling.table.upsert(device("a"));
        lan.table.upsert(device("a").with_address("10.0.0.2:1"));
        settle().await;

        assert!(merged.has_changed().unwrap());
        let a = aggregator.device(&"a".into()).unwrap();
        assert_eq!(a.address.as_deref(), Some("10.0.0.2:1"));

        // LAN loses it, the rendezvous copy shows through.
        lan.table.remove(&"a".into());
        settle().await;
        assert_eq!(aggregator.device(&"a".into()), Some(device("a")));
        assert_eq!(aggregator.current_devices().len(), 2);
    }

    #[tokio::test]
    async fn events_are_forwarded_unmodified() {
        let signaling = FakeBackend::new(BackendKind::SignalingRendezvous);
        let lan = FakeBackend::new(BackendKind::LocalAdvertisement);
        let aggregator = DiscoveryAggregator::new(vec![signaling.clone(), lan.clone()]);
        let mut events = aggregator.observe_discovery_events();

        aggregator.start_discovery().await.unwrap();
        lan.table.upsert(device("a"));
        settle().await;

        let mut seen = vec![];
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen.iter().filter(|e| **e == DiscoveryEvent::Started).count(),
            2
        );
        assert!(seen.contains(&DiscoveryEvent::DeviceFound(device("a"))));
        assert!(aggregator.is_discovering());

        aggregator.stop_discovery().await;
        assert!(!aggregator.is_discovering());
    }

    #[tokio::test]
    async fn one_failing_backend_does_not_block_others() {
        let broken = FakeBackend::failing(BackendKind::SignalingRendezvous);
        let lan = FakeBackend::new(BackendKind::LocalAdvertisement);
        let aggregator = DiscoveryAggregator::new(vec![broken.clone(), lan.clone()]);
        let mut events = aggregator.observe_discovery_events();

        aggregator.start_discovery().await.unwrap();
        aggregator.register_service(&device("me")).await.unwrap();
        assert!(lan.is_discovering());
        assert!(!broken.is_discovering());

        settle().await;
        let mut failed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, DiscoveryEvent::Failed(_)) {
                failed += 1;
            }
        }
        assert_eq!(failed, 2);
    }

    #[tokio::test]
    async fn all_failing_is_an_error() {
        let aggregator = DiscoveryAggregator::new(vec![
            FakeBackend::failing(BackendKind::SignalingRendezvous),
            FakeBackend::failing(BackendKind::LocalAdvertisement),
        ]);
        assert!(matches!(
            aggregator.start_discovery().await,
            Err(MeshError::Discovery { .. })
        ));
        assert!(aggregator.register_service(&device("me")).await.is_err());
    }

    #[tokio::test]
    async fn no_backends_is_fine() {
        let aggregator = DiscoveryAggregator::new(vec![]);
        aggregator.start_discovery().await.unwrap();
        assert!(!aggregator.is_discovering());
        assert!(aggregator.current_devices().is_empty());
    }

    #[tokio::test]
    async fn lan_backend_wins_over_rendezvous() {
        let signaling = FakeBackend::new(BackendKind::SignalingRendezvous);
        let mock = MockLanDiscovery::new();
        let lan = Arc::new(LocalAdvertisementBackend::new(
            Arc::new(mock.clone()),
            &DiscoveryConfig::new(),
        ));
        let aggregator = DiscoveryAggregator::new(vec![signaling.clone(), lan]);
        aggregator.start_discovery().await.unwrap();

        signaling
            .table
            .upsert(Device::new("peer-1", "Desk", DeviceType::Desktop));
        mock.push(LanEvent::Resolved(service("peer-1", "Desk", 7)))
            .await;
        settle().await;

        let merged = aggregator.current_devices();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].address.as_deref(), Some("192.168.1.7:47800"));
    }
}
