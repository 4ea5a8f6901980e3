/// LocalAdvertisement backend: peers found through LAN service discovery.
///
/// The local device is advertised as `<deviceName>@<deviceId>` with TXT
/// properties `id`, `name`, `type` and `pk`. Resolved services become
/// [`Device`]s whose address is the resolved `ip:port`. A removal is
/// mapped back to a device id through the services resolved so far, and
/// only falls back to parsing the instance name when the service was never
/// resolved.
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::discovery::backend::{DeviceList, DiscoveryBackend};
use crate::discovery::table::DeviceTable;
use crate::discovery::types::{BackendKind, DiscoveryEvent};
use crate::error::MeshError;
use crate::types::{Device, DeviceId, DeviceType};

/// TXT property keys.
pub const TXT_ID: &str = "id";
pub const TXT_NAME: &str = "name";
pub const TXT_TYPE: &str = "type";
pub const TXT_PUBLIC_KEY: &str = "pk";

/// DNS-SD instance labels are limited to 63 bytes.
const MAX_INSTANCE_LEN: usize = 63;

// ── Collaborator ────────────────────────────────────────────────────────

/// A service resolved on the LAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanService {
    /// `<instance>.<service type>`.
    pub fullname: String,
    pub instance_name: String,
    pub host: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LanEvent {
    Resolved(LanService),
    Removed { fullname: String },
    ResolveFailed { fullname: String, reason: String },
}

/// What the local device advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanAdvert {
    pub service_type: String,
    pub instance_name: String,
    pub port: u16,
    pub properties: HashMap<String, String>,
}

/// LAN service-discovery primitive (mDNS/DNS-SD in production).
#[async_trait::async_trait]
pub trait LanServiceDiscovery: Send + Sync {
    /// Start browsing `service_type`. Events arrive on the returned channel
    /// until [`stop_browse`](Self::stop_browse).
    async fn browse(&self, service_type: &str) -> Result<mpsc::Receiver<LanEvent>, MeshError>;

    async fn stop_browse(&self, service_type: &str) -> Result<(), MeshError>;

    /// Advertise a service. Returns its full name.
    async fn register(&self, advert: &LanAdvert) -> Result<String, MeshError>;

    async fn unregister(&self, fullname: &str) -> Result<(), MeshError>;
}

// ── Name conventions ────────────────────────────────────────────────────

/// Parse the device id out of an advertised instance name
/// (`<deviceName>@<deviceId>`).
pub fn extract_device_id(instance_name: &str) -> Option<DeviceId> {
    let (_, id) = instance_name.rsplit_once('@')?;
    let id = id.trim();
    if id.is_empty() {
        None
    } else {
        Some(DeviceId::new(id))
    }
}

/// `<deviceName>@<deviceId>`, truncating the name to fit one DNS label.
///
/// An id too long to fit next to any name is truncated on its own and the
/// `@` dropped, so the label never parses back to a wrong id; peers then
/// rely on the `id` TXT property.
pub fn instance_name_for(device: &Device) -> String {
    let id = device.device_id.as_str();
    if id.len() + 1 > MAX_INSTANCE_LEN {
        return truncate_to(id.replace('@', "_"), MAX_INSTANCE_LEN);
    }
    let budget = MAX_INSTANCE_LEN - id.len() - 1;
    let name = truncate_to(device.device_name.replace('@', "_"), budget);
    format!("{name}@{id}")
}

fn truncate_to(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

fn instance_from_fullname<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
}

/// Map a resolved service to a device. `None` if no id can be derived.
pub fn service_to_device(service: &LanService) -> Option<Device> {
    let device_id = service
        .properties
        .get(TXT_ID)
        .filter(|id| !id.trim().is_empty())
        .map(|id| DeviceId::new(id.trim()))
        .or_else(|| extract_device_id(&service.instance_name))?;

    let device_name = service
        .properties
        .get(TXT_NAME)
        .cloned()
        .or_else(|| {
            service
                .instance_name
                .rsplit_once('@')
                .map(|(name, _)| name.to_string())
        })
        .unwrap_or_else(|| service.instance_name.clone());

    let device_type = service
        .properties
        .get(TXT_TYPE)
        .map(|t| DeviceType::from_tag(t))
        .unwrap_or_default();

    let address = preferred_address(&service.addresses)
        .map(|ip| SocketAddr::new(ip, service.port).to_string())
        .or_else(|| {
            let host = service.host.trim_end_matches('.');
            (!host.is_empty()).then(|| format!("{host}:{}", service.port))
        });

    Some(Device {
        device_id,
        device_name,
        device_type,
        status: Default::default(),
        address,
        public_key: service.properties.get(TXT_PUBLIC_KEY).cloned(),
        is_trusted: false,
    })
}

/// IPv4 first, then anything else; stable across calls.
fn preferred_address(addresses: &[IpAddr]) -> Option<IpAddr> {
    let mut sorted = addresses.to_vec();
    sorted.sort_by_key(|ip| (!ip.is_ipv4(), *ip));
    sorted.into_iter().next()
}

// ── Backend ─────────────────────────────────────────────────────────────

struct Shared {
    table: DeviceTable,
    /// fullname → device id of every resolved service.
    names: DashMap<String, DeviceId>,
    local_id: Mutex<Option<DeviceId>>,
    service_type: String,
}

impl Shared {
    fn is_local(&self, id: &DeviceId) -> bool {
        self.local_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            == Some(id)
    }

    fn on_event(&self, event: LanEvent) {
        match event {
            LanEvent::Resolved(service) => {
                let Some(device) = service_to_device(&service) else {
                    tracing::debug!("lan: no device id in {}, dropping", service.fullname);
                    return;
                };
                if self.is_local(&device.device_id) {
                    return;
                }
                self.names
                    .insert(service.fullname.clone(), device.device_id.clone());
                if self.table.upsert(device) {
                    tracing::debug!("lan: resolved {}", service.fullname);
                }
            }
            LanEvent::Removed { fullname } => {
                let id = self.names.remove(&fullname).map(|(_, id)| id).or_else(|| {
                    extract_device_id(instance_from_fullname(&fullname, &self.service_type))
                });
                match id {
                    Some(id) => {
                        self.table.remove(&id);
                    }
                    None => tracing::debug!("lan: cannot map removed service {fullname} to a device"),
                }
            }
            LanEvent::ResolveFailed { fullname, reason } => {
                tracing::debug!("lan: resolve failed for {fullname}: {reason}");
            }
        }
    }
}

struct Registration {
    device_id: DeviceId,
    fullname: String,
}

struct Browse {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Discovery over LAN service advertisement.
pub struct LocalAdvertisementBackend {
    lan: Arc<dyn LanServiceDiscovery>,
    shared: Arc<Shared>,
    service_port: u16,
    browse: tokio::sync::Mutex<Option<Browse>>,
    discovering: AtomicBool,
    registration: tokio::sync::Mutex<Option<Registration>>,
}

impl LocalAdvertisementBackend {
    pub fn new(lan: Arc<dyn LanServiceDiscovery>, config: &DiscoveryConfig) -> Self {
        Self {
            lan,
            shared: Arc::new(Shared {
                table: DeviceTable::new(),
                names: DashMap::new(),
                local_id: Mutex::new(None),
                service_type: config.service_type.clone(),
            }),
            service_port: config.service_port,
            browse: tokio::sync::Mutex::new(None),
            discovering: AtomicBool::new(false),
            registration: tokio::sync::Mutex::new(None),
        }
    }

    /// Backend on the system mDNS responder.
    pub fn mdns(config: &DiscoveryConfig) -> Result<Self, MeshError> {
        let lan = crate::discovery::mdns::MdnsServiceDiscovery::new()?;
        Ok(Self::new(Arc::new(lan), config))
    }

    pub fn current_devices(&self) -> DeviceList {
        self.shared.table.snapshot()
    }
}

async fn browse_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<LanEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => shared.on_event(event),
                None => {
                    tracing::warn!("lan: browse channel closed");
                    break;
                }
            },
        }
    }
}

#[async_trait::async_trait]
impl DiscoveryBackend for LocalAdvertisementBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalAdvertisement
    }

    async fn start_discovery(&self) -> Result<(), MeshError> {
        let mut browse = self.browse.lock().await;
        if browse.is_some() {
            tracing::debug!("lan: discovery already running");
            return Ok(());
        }

        match self.lan.browse(&self.shared.service_type).await {
            Ok(rx) => {
                let cancel = CancellationToken::new();
                let task = tokio::spawn(browse_loop(self.shared.clone(), rx, cancel.clone()));
                *browse = Some(Browse { cancel, task });
                self.discovering.store(true, Ordering::Release);
                tracing::info!("lan: browsing {}", self.shared.service_type);
                self.shared.table.emit(DiscoveryEvent::Started);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("lan: cannot browse: {e}");
                self.shared.table.emit(DiscoveryEvent::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn stop_discovery(&self) {
        let Some(browse) = self.browse.lock().await.take() else {
            return;
        };
        browse.cancel.cancel();
        if let Err(e) = browse.task.await {
            tracing::warn!("lan: browse loop ended abnormally: {e}");
        }
        self.discovering.store(false, Ordering::Release);
        if let Err(e) = self.lan.stop_browse(&self.shared.service_type).await {
            tracing::warn!("lan: stop browse failed: {e}");
        }
        self.shared.names.clear();
        self.shared.table.clear();
        tracing::info!("lan: stopped");
        self.shared.table.emit(DiscoveryEvent::Stopped);
    }

    async fn register_service(&self, device: &Device) -> Result<(), MeshError> {
        let mut registration = self.registration.lock().await;
        if let Some(previous) = registration.take() {
            if let Err(e) = self.lan.unregister(&previous.fullname).await {
                tracing::warn!("lan: unregister {} failed: {e}", previous.fullname);
            }
        }

        let mut properties = HashMap::from([
            (TXT_ID.to_string(), device.device_id.to_string()),
            (TXT_NAME.to_string(), device.device_name.clone()),
            (TXT_TYPE.to_string(), device.device_type.as_str().to_string()),
        ]);
        if let Some(pk) = &device.public_key {
            properties.insert(TXT_PUBLIC_KEY.to_string(), pk.clone());
        }
        let advert = LanAdvert {
            service_type: self.shared.service_type.clone(),
            instance_name: instance_name_for(device),
            port: self.service_port,
            properties,
        };

        match self.lan.register(&advert).await {
            Ok(fullname) => {
                *self
                    .shared
                    .local_id
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(device.device_id.clone());
                self.shared.table.remove(&device.device_id);
                tracing::info!("lan: advertising {fullname}");
                self.shared
                    .table
                    .emit(DiscoveryEvent::ServiceRegistered(fullname.clone()));
                *registration = Some(Registration {
                    device_id: device.device_id.clone(),
                    fullname,
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!("lan: register failed: {e}");
                self.shared
                    .table
                    .emit(DiscoveryEvent::ServiceRegistrationFailed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn unregister_service(&self) {
        let Some(registration) = self.registration.lock().await.take() else {
            return;
        };
        if let Err(e) = self.lan.unregister(&registration.fullname).await {
            tracing::warn!("lan: unregister {} failed: {e}", registration.fullname);
        }
        let mut local = self
            .shared
            .local_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if local.as_ref() == Some(&registration.device_id) {
            *local = None;
        }
        tracing::info!("lan: withdrew {}", registration.fullname);
    }

    fn observe_discovered_devices(&self) -> watch::Receiver<DeviceList> {
        self.shared.table.subscribe_devices()
    }

    fn observe_discovery_events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.shared.table.subscribe_events()
    }

    fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::Acquire)
    }
}

// ── MockLanDiscovery (tests) ────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::mock::{service, MockLanDiscovery};
    use super::*;

    fn backend() -> (LocalAdvertisementBackend, MockLanDiscovery) {
        let lan = MockLanDiscovery::new();
        let backend = LocalAdvertisementBackend::new(Arc::new(lan.clone()), &DiscoveryConfig::new());
        (backend, lan)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn extract_id_from_instance_name() {
        assert_eq!(extract_device_id("Office PC@abc-123"), Some("abc-123".into()));
        assert_eq!(extract_device_id("me@home@dev9"), Some("dev9".into()));
        assert_eq!(extract_device_id("no-separator"), None);
        assert_eq!(extract_device_id("trailing@ "), None);
    }

    #[test]
    fn instance_name_fits_one_label() {
        let device = Device::new("0123456789abcdef", "é".repeat(40), DeviceType::Mobile);
        let name = instance_name_for(&device);
        assert!(name.len() <= MAX_INSTANCE_LEN);
        assert_eq!(extract_device_id(&name), Some("0123456789abcdef".into()));
    }

    #[test]
    fn long_id_still_fits_one_label() {
        let id = "f".repeat(64);
        let device = Device::new(id.as_str(), "Laptop", DeviceType::Desktop);
        let name = instance_name_for(&device);
        assert_eq!(name.len(), MAX_INSTANCE_LEN);
        assert_eq!(extract_device_id(&name), None);

        let id = "e".repeat(MAX_INSTANCE_LEN - 1);
        let device = Device::new(id.as_str(), "Laptop", DeviceType::Desktop);
        assert_eq!(instance_name_for(&device), format!("@{id}"));
    }

    #[tokio::test]
    async fn long_id_advert_keeps_full_id_in_txt() {
        let (backend, lan) = backend();
        let id = "a".repeat(80);
        let device = Device::new(id.as_str(), "Laptop", DeviceType::Desktop);
        backend.register_service(&device).await.unwrap();

        let advert = &lan.registered()[0];
        assert!(advert.instance_name.len() <= MAX_INSTANCE_LEN);
        assert_eq!(advert.properties.get(TXT_ID), Some(&id));
    }

    #[test]
    fn instance_name_escapes_separator() {
        let device = Device::new("id1", "a@b", DeviceType::Web);
        assert_eq!(instance_name_for(&device), "a_b@id1");
    }

    #[test]
    fn resolved_service_maps_to_device() {
        let mut svc = service("dev-a", "Laptop", 7);
        svc.addresses.insert(0, "fe80::1".parse().unwrap());
        svc.properties.insert(TXT_PUBLIC_KEY.into(), "pk-a".into());

        let device = service_to_device(&svc).unwrap();
        assert_eq!(device.device_id, DeviceId::new("dev-a"));
        assert_eq!(device.device_name, "Laptop");
        assert_eq!(device.device_type, DeviceType::Desktop);
        assert_eq!(device.address.as_deref(), Some("192.168.1.7:47800"));
        assert_eq!(device.public_key.as_deref(), Some("pk-a"));
    }

    #[test]
    fn missing_txt_falls_back_to_instance_name() {
        let mut svc = service("dev-b", "Phone", 8);
        svc.properties.clear();
        svc.addresses.clear();

        let device = service_to_device(&svc).unwrap();
        assert_eq!(device.device_id, DeviceId::new("dev-b"));
        assert_eq!(device.device_name, "Phone");
        assert_eq!(device.device_type, DeviceType::Other);
        assert_eq!(device.address.as_deref(), Some("dev-b.local:47800"));

        svc.instance_name = "anonymous".into();
        assert!(service_to_device(&svc).is_none());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (backend, _lan) = backend();
        let mut events = backend.observe_discovery_events();

        backend.start_discovery().await.unwrap();
        backend.start_discovery().await.unwrap();
        assert!(backend.is_discovering());
        assert_eq!(events.try_recv().unwrap(), DiscoveryEvent::Started);
        assert!(events.try_recv().is_err());

        backend.stop_discovery().await;
        assert!(!backend.is_discovering());
        assert_eq!(events.try_recv().unwrap(), DiscoveryEvent::Stopped);

        backend.stop_discovery().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn browse_failure_is_reported() {
        let (backend, lan) = backend();
        lan.set_fail_browse(true);
        let mut events = backend.observe_discovery_events();

        assert!(backend.start_discovery().await.is_err());
        assert!(!backend.is_discovering());
        assert!(matches!(events.try_recv().unwrap(), DiscoveryEvent::Failed(_)));

        lan.set_fail_browse(false);
        backend.start_discovery().await.unwrap();
        assert!(backend.is_discovering());
    }

    #[tokio::test]
    async fn resolve_and_remove() {
        let (backend, lan) = backend();
        backend.start_discovery().await.unwrap();
        let mut events = backend.observe_discovery_events();

        lan.push(LanEvent::Resolved(service("dev-a", "Laptop", 7))).await;
        lan.push(LanEvent::ResolveFailed {
            fullname: "Broken@dev-x._meshlink._tcp.local.".into(),
            reason: "timeout".into(),
        })
        .await;
        settle().await;

        assert_eq!(backend.current_devices().len(), 1);
        assert!(matches!(events.try_recv().unwrap(), DiscoveryEvent::DeviceFound(d) if d.device_id == DeviceId::new("dev-a")));
        assert!(events.try_recv().is_err());

        lan.push(LanEvent::Removed {
            fullname: "Laptop@dev-a._meshlink._tcp.local.".into(),
        })
        .await;
        settle().await;
        assert!(backend.current_devices().is_empty());
        assert_eq!(events.try_recv().unwrap(), DiscoveryEvent::DeviceLost("dev-a".into()));
    }

    #[tokio::test]
    async fn removal_uses_resolved_id_over_name() {
        let (backend, lan) = backend();
        backend.start_discovery().await.unwrap();

        // Instance name carries no id; only the TXT record does.
        let mut svc = service("dev-c", "Tablet", 9);
        svc.instance_name = "Tablet".into();
        svc.fullname = "Tablet._meshlink._tcp.local.".into();
        lan.push(LanEvent::Resolved(svc)).await;
        settle().await;
        assert_eq!(backend.current_devices().len(), 1);

        let mut events = backend.observe_discovery_events();
        lan.push(LanEvent::Removed {
            fullname: "Tablet._meshlink._tcp.local.".into(),
        })
        .await;
        settle().await;
        assert_eq!(events.try_recv().unwrap(), DiscoveryEvent::DeviceLost("dev-c".into()));
    }

    #[tokio::test]
    async fn unmappable_removal_is_dropped() {
        let (backend, lan) = backend();
        backend.start_discovery().await.unwrap();
        lan.push(LanEvent::Resolved(service("dev-a", "Laptop", 7))).await;
        settle().await;
        let mut events = backend.observe_discovery_events();

        lan.push(LanEvent::Removed {
            fullname: "Stranger._meshlink._tcp.local.".into(),
        })
        .await;
        settle().await;
        assert!(events.try_recv().is_err());
        assert_eq!(backend.current_devices().len(), 1);
    }

    #[tokio::test]
    async fn register_advertises_and_filters_self() {
        let (backend, lan) = backend();
        backend.start_discovery().await.unwrap();
        let mut events = backend.observe_discovery_events();

        let me = Device::new("me", "My Laptop", DeviceType::Desktop).with_public_key("pk-me");
        backend.register_service(&me).await.unwrap();

        let advert = &lan.registered()[0];
        assert_eq!(advert.instance_name, "My Laptop@me");
        assert_eq!(advert.properties[TXT_ID], "me");
        assert_eq!(advert.properties[TXT_TYPE], "desktop");
        assert_eq!(advert.properties[TXT_PUBLIC_KEY], "pk-me");
        assert_eq!(
            events.try_recv().unwrap(),
            DiscoveryEvent::ServiceRegistered("My Laptop@me._meshlink._tcp.local.".into())
        );

        // Our own advert echoed back by the responder is ignored.
        lan.push(LanEvent::Resolved(service("me", "My Laptop", 2))).await;
        settle().await;
        assert!(backend.current_devices().is_empty());

        backend.unregister_service().await;
        assert_eq!(lan.unregistered(), vec!["My Laptop@me._meshlink._tcp.local.".to_string()]);
    }

    #[tokio::test]
    async fn register_failure_is_reported() {
        let (backend, lan) = backend();
        lan.set_fail_register(true);
        let mut events = backend.observe_discovery_events();

        let me = Device::new("me", "My Laptop", DeviceType::Desktop);
        assert!(backend.register_service(&me).await.is_err());
        assert!(matches!(
            events.try_recv().unwrap(),
            DiscoveryEvent::ServiceRegistrationFailed(_)
        ));
    }

    #[tokio::test]
    async fn stop_clears_peers() {
        let (backend, lan) = backend();
        backend.start_discovery().await.unwrap();
        lan.push(LanEvent::Resolved(service("dev-a", "Laptop", 7))).await;
        settle().await;
        assert_eq!(backend.current_devices().len(), 1);

        backend.stop_discovery().await;
        assert!(backend.current_devices().is_empty());
    }

    #[tokio::test]
    async fn buffered_events_are_dropped_on_stop() {
        let (backend, lan) = backend();
        backend.start_discovery().await.unwrap();
        let mut events = backend.observe_discovery_events();

        for octet in 1..=10 {
            let id = format!("dev-{octet}");
            lan.push(LanEvent::Resolved(service(&id, "Laptop", octet))).await;
        }
        backend.stop_discovery().await;
        settle().await;

        assert!(!backend.is_discovering());
        assert!(backend.current_devices().is_empty());

        let mut seen = vec![];
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let stopped = seen
            .iter()
            .position(|e| *e == DiscoveryEvent::Stopped)
            .unwrap();
        assert_eq!(stopped, seen.len() - 1);
    }
}
