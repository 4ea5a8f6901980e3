/// Per-backend peer table.
///
/// Owns a backend's devices, republishes a fresh snapshot after every
/// change and emits `DeviceFound` / `DeviceLost` for what changed. Events
/// are sent while the table lock is held, so they follow table order.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};

use crate::discovery::backend::DeviceList;
use crate::discovery::types::DiscoveryEvent;
use crate::types::{Device, DeviceId};

const EVENT_CAPACITY: usize = 128;

pub(crate) struct DeviceTable {
    devices: Mutex<BTreeMap<DeviceId, Device>>,
    snapshot: watch::Sender<DeviceList>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl DeviceTable {
    pub(crate) fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            devices: Mutex::new(BTreeMap::new()),
            snapshot,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<DeviceId, Device>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, devices: &BTreeMap<DeviceId, Device>) {
        self.snapshot
            .send_replace(Arc::new(devices.values().cloned().collect()));
    }

    pub(crate) fn emit(&self, event: DiscoveryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe_devices(&self) -> watch::Receiver<DeviceList> {
        self.snapshot.subscribe()
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub(crate) fn snapshot(&self) -> DeviceList {
        self.snapshot.borrow().clone()
    }

    /// Insert or update. Emits `DeviceFound` and returns true unless the
    /// stored entry was already identical.
    pub(crate) fn upsert(&self, device: Device) -> bool {
        let mut devices = self.lock();
        if devices.get(&device.device_id) == Some(&device) {
            return false;
        }
        devices.insert(device.device_id.clone(), device.clone());
        self.publish(&devices);
        self.emit(DiscoveryEvent::DeviceFound(device));
        true
    }

    /// Remove. Emits `DeviceLost` if the device was present.
    pub(crate) fn remove(&self, device_id: &DeviceId) -> bool {
        let mut devices = self.lock();
        if devices.remove(device_id).is_none() {
            return false;
        }
        self.publish(&devices);
        self.emit(DiscoveryEvent::DeviceLost(device_id.clone()));
        true
    }

    /// Replace the whole table, emitting `DeviceLost` for ids that
    /// disappeared and `DeviceFound` for new or changed ones.
    pub(crate) fn replace(&self, incoming: Vec<Device>) {
        let next: BTreeMap<DeviceId, Device> = incoming
            .into_iter()
            .map(|d| (d.device_id.clone(), d))
            .collect();

        let mut devices = self.lock();
        let lost: Vec<DeviceId> = devices
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();
        let found: Vec<Device> = next
            .values()
            .filter(|d| devices.get(&d.device_id) != Some(*d))
            .cloned()
            .collect();

        if lost.is_empty() && found.is_empty() {
            return;
        }
        *devices = next;
        self.publish(&devices);
        for id in lost {
            self.emit(DiscoveryEvent::DeviceLost(id));
        }
        for device in found {
            self.emit(DiscoveryEvent::DeviceFound(device));
        }
    }

    /// Drop everything without per-device events.
    pub(crate) fn clear(&self) {
        let mut devices = self.lock();
        if devices.is_empty() {
            return;
        }
        devices.clear();
        self.publish(&devices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceType;

    fn device(id: &str) -> Device {
        Device::new(id, id, DeviceType::Mobile)
    }

    fn drain(events: &mut broadcast::Receiver<DiscoveryEvent>) -> Vec<DiscoveryEvent> {
        let mut seen = vec![];
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[test]
    fn upsert_emits_only_on_change() {
        let table = DeviceTable::new();
        let mut events = table.subscribe_events();

        assert!(table.upsert(device("a")));
        assert!(!table.upsert(device("a")));
        assert!(table.upsert(device("a").with_address("10.0.0.1:1")));

        assert_eq!(drain(&mut events).len(), 2);
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn remove_emits_lost() {
        let table = DeviceTable::new();
        table.upsert(device("a"));
        let mut events = table.subscribe_events();

        assert!(table.remove(&"a".into()));
        assert!(!table.remove(&"a".into()));
        assert_eq!(drain(&mut events), vec![DiscoveryEvent::DeviceLost("a".into())]);
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn replace_diffs() {
        let table = DeviceTable::new();
        table.upsert(device("a"));
        table.upsert(device("b"));
        let mut devices = table.subscribe_devices();
        let mut events = table.subscribe_events();

        table.replace(vec![device("b"), device("c")]);

        assert_eq!(
            drain(&mut events),
            vec![
                DiscoveryEvent::DeviceLost("a".into()),
                DiscoveryEvent::DeviceFound(device("c")),
            ]
        );
        assert!(devices.has_changed().unwrap());
        let ids: Vec<_> = devices
            .borrow_and_update()
            .iter()
            .map(|d| d.device_id.clone())
            .collect();
        assert_eq!(ids, vec![DeviceId::new("b"), DeviceId::new("c")]);
    }

    #[test]
    fn identical_replace_is_silent() {
        let table = DeviceTable::new();
        table.replace(vec![device("a")]);
        let devices = table.subscribe_devices();
        let mut events = table.subscribe_events();

        table.replace(vec![device("a")]);
        assert!(drain(&mut events).is_empty());
        assert!(!devices.has_changed().unwrap());
    }
}
