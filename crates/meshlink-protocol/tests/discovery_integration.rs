/// Integration tests: both discovery backends behind the aggregator.
///
/// The LAN is an in-memory `LanServiceDiscovery`; the rendezvous server is
/// the transport crate's mock socket, driven with real wire frames.
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshlink_protocol::discovery::{LanAdvert, LanEvent, LanService};
use meshlink_protocol::{
    Device, DeviceId, DeviceType, DiscoveryAggregator, DiscoveryBackend, DiscoveryConfig,
    DiscoveryEvent, LanServiceDiscovery, LocalAdvertisementBackend, MeshError,
    SignalingRendezvousBackend,
};
use meshlink_transport::mock::{MockPeer, MockTransport};
use meshlink_transport::SignalingConfig;
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

#[derive(Default)]
struct LanState {
    tx: Option<mpsc::Sender<LanEvent>>,
    broken: bool,
    adverts: Vec<LanAdvert>,
}

/// A LAN segment the test controls.
#[derive(Clone, Default)]
struct FakeLan {
    state: Arc<Mutex<LanState>>,
}

impl FakeLan {
    fn broken() -> Self {
        let lan = Self::default();
        lan.state.lock().unwrap().broken = true;
        lan
    }

    async fn announce(&self, id: &str, name: &str, ip: [u8; 4]) {
        let service = LanService {
            fullname: format!("{name}@{id}._meshlink._tcp.local."),
            instance_name: format!("{name}@{id}"),
            host: format!("{id}.local."),
            addresses: vec![IpAddr::from(ip)],
            port: 47_800,
            properties: HashMap::from([
                ("id".to_string(), id.to_string()),
                ("name".to_string(), name.to_string()),
                ("type".to_string(), "mobile".to_string()),
            ]),
        };
        let tx = self.state.lock().unwrap().tx.clone().unwrap();
        tx.send(LanEvent::Resolved(service)).await.unwrap();
    }
}

#[async_trait::async_trait]
impl LanServiceDiscovery for FakeLan {
    async fn browse(&self, _service_type: &str) -> Result<mpsc::Receiver<LanEvent>, MeshError> {
        let mut state = self.state.lock().unwrap();
        if state.broken {
            return Err(MeshError::Discovery {
                backend: "local-advertisement",
                reason: "no multicast route".into(),
            });
        }
        let (tx, rx) = mpsc::channel(16);
        state.tx = Some(tx);
        Ok(rx)
    }

    async fn stop_browse(&self, _service_type: &str) -> Result<(), MeshError> {
        self.state.lock().unwrap().tx = None;
        Ok(())
    }

    async fn register(&self, advert: &LanAdvert) -> Result<String, MeshError> {
        self.state.lock().unwrap().adverts.push(advert.clone());
        Ok(format!("{}.{}", advert.instance_name, advert.service_type))
    }

    async fn unregister(&self, _fullname: &str) -> Result<(), MeshError> {
        Ok(())
    }
}

struct Mesh {
    aggregator: DiscoveryAggregator,
    lan: FakeLan,
    servers: mpsc::UnboundedReceiver<MockPeer>,
}

fn mesh(lan: FakeLan) -> Mesh {
    let config = DiscoveryConfig::new().signaling_url("ws://10.0.0.1:8080/ws");
    let (transport, servers) = MockTransport::new();

    let rendezvous: Arc<dyn DiscoveryBackend> = Arc::new(SignalingRendezvousBackend::new(
        Arc::new(transport),
        SignalingConfig::new(),
        config.clone(),
    ));
    let local: Arc<dyn DiscoveryBackend> =
        Arc::new(LocalAdvertisementBackend::new(Arc::new(lan.clone()), &config));

    Mesh {
        aggregator: DiscoveryAggregator::new(vec![rendezvous, local]),
        lan,
        servers,
    }
}

async fn frame(server: &mut MockPeer) -> Value {
    serde_json::from_str(&server.from_client.recv().await.unwrap()).unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn me() -> Device {
    Device::new("me", "Laptop", DeviceType::Desktop)
}

/// Same peer seen on the LAN and through the server: the LAN copy wins.
#[tokio::test(start_paused = true)]
async fn lan_copy_wins_the_merge() {
    init_tracing();
    let mut mesh = mesh(FakeLan::default());

    mesh.aggregator.register_service(&me()).await.unwrap();
    mesh.aggregator.start_discovery().await.unwrap();
    assert!(mesh.aggregator.is_discovering());

    let mut server = mesh.servers.recv().await.unwrap();
    assert_eq!(frame(&mut server).await["type"], "register");
    assert_eq!(frame(&mut server).await["type"], "get-peers");

    let peers = json!({
        "type": "peers-list",
        "peers": [
            {"deviceId": "me", "deviceName": "Laptop"},
            {"deviceId": "phone", "deviceName": "Phone", "deviceType": "mobile"},
            {"deviceId": "tablet", "deviceName": "Tablet", "deviceType": "mobile"}
        ]
    });
    server.to_client.send(Ok(peers.to_string())).unwrap();
    mesh.lan.announce("phone", "Phone", [192, 168, 1, 42]).await;
    // Our own advert echoed back by the LAN is ignored.
    mesh.lan.announce("me", "Laptop", [192, 168, 1, 10]).await;
    settle().await;

    let merged = mesh.aggregator.current_devices();
    let ids: Vec<&str> = merged.iter().map(|d| d.device_id.as_str()).collect();
    assert_eq!(ids, vec!["phone", "tablet"]);

    let phone = mesh.aggregator.device(&DeviceId::new("phone")).unwrap();
    assert_eq!(phone.address.as_deref(), Some("192.168.1.42:47800"));
    let tablet = mesh.aggregator.device(&DeviceId::new("tablet")).unwrap();
    assert_eq!(tablet.address, None);

    // The peer leaves the server; the LAN still sees it.
    let gone = json!({"type": "peer-status", "deviceId": "phone", "status": "offline"});
    server.to_client.send(Ok(gone.to_string())).unwrap();
    settle().await;
    assert!(mesh.aggregator.device(&DeviceId::new("phone")).is_some());

    let adverts = mesh.lan.state.lock().unwrap().adverts.clone();
    assert_eq!(adverts.len(), 1);
    assert_eq!(adverts[0].instance_name, "Laptop@me");
}

/// A LAN without multicast does not keep the rendezvous backend down.
#[tokio::test(start_paused = true)]
async fn broken_lan_does_not_block_rendezvous() {
    init_tracing();
    let mut mesh = mesh(FakeLan::broken());
    let mut events = mesh.aggregator.observe_discovery_events();

    mesh.aggregator.start_discovery().await.unwrap();
    let mut server = mesh.servers.recv().await.unwrap();
    assert_eq!(frame(&mut server).await["type"], "get-peers");

    let peers = json!({"type": "peers-list", "peers": [{"deviceId": "desk"}]});
    server.to_client.send(Ok(peers.to_string())).unwrap();
    settle().await;

    assert_eq!(mesh.aggregator.current_devices().len(), 1);

    let mut seen = vec![];
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(e, DiscoveryEvent::Failed(_))));
    assert!(seen.contains(&DiscoveryEvent::Started));
    assert!(seen
        .iter()
        .any(|e| matches!(e, DiscoveryEvent::DeviceFound(d) if d.device_id.as_str() == "desk")));

    mesh.aggregator.stop_discovery().await;
    settle().await;
    assert!(!mesh.aggregator.is_discovering());
    assert!(mesh.aggregator.current_devices().is_empty());
}
