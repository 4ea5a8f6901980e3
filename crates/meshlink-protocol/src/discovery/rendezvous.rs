/// SignalingRendezvous backend: peers listed by a rendezvous server.
///
/// Holds a [`SignalingConnection`] to the configured server. Every time the
/// link comes up the backend registers the local device and asks for the
/// peer list, then sends a heartbeat plus a refresh request on a fixed
/// interval. `peers-list` replaces the whole list; `peer-status` applies
/// one add or remove.
///
/// The link's own bounded reconnect handles short drops. Once it gives up,
/// this backend waits a fixed delay and dials again, for as long as
/// discovery runs.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use meshlink_transport::{
    ConnectionState, SignalingConfig, SignalingConnection, SignalingConnectionEvent,
    SignalingTransport, WsTransport,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::discovery::backend::{DeviceList, DiscoveryBackend};
use crate::discovery::table::DeviceTable;
use crate::discovery::types::{BackendKind, DiscoveryEvent};
use crate::error::MeshError;
use crate::types::{Device, DeviceId, DeviceStatus};

// ── Wire messages ───────────────────────────────────────────────────────

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Register {
        device: Device,
    },
    Unregister {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
    GetPeers,
    Heartbeat {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerPresence {
    Online,
    Offline,
}

/// Server → client. Unknown `type`s parse as [`ServerMessage::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    PeersList {
        peers: Vec<Device>,
    },
    PeerStatus {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        status: PeerPresence,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<Device>,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

// ── Shared state ────────────────────────────────────────────────────────

struct Shared {
    table: DeviceTable,
    local: Mutex<Option<Device>>,
}

impl Shared {
    fn local(&self) -> Option<Device> {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn local_id(&self) -> Option<DeviceId> {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|d| d.device_id.clone())
    }

    fn handle_frame(&self, text: &str) {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("rendezvous: dropping malformed frame: {e}");
                return;
            }
        };
        let local_id = self.local_id();

        match message {
            ServerMessage::PeersList { peers } => {
                let peers: Vec<Device> = peers
                    .into_iter()
                    .filter(|d| Some(&d.device_id) != local_id.as_ref())
                    .collect();
                tracing::debug!("rendezvous: {} peers listed", peers.len());
                self.table.replace(peers);
            }
            ServerMessage::PeerStatus {
                device_id,
                status,
                device,
            } => {
                if Some(&device_id) == local_id.as_ref() {
                    return;
                }
                match status {
                    PeerPresence::Online => {
                        let device = device
                            .filter(|d| d.device_id == device_id)
                            .unwrap_or_else(|| {
                                Device::new(device_id.clone(), device_id.to_string(), Default::default())
                            });
                        self.table.upsert(device.with_status(DeviceStatus::Discovered));
                    }
                    PeerPresence::Offline => {
                        self.table.remove(&device_id);
                    }
                }
            }
            ServerMessage::Error { message } => {
                tracing::warn!("rendezvous: server error: {message}");
            }
            ServerMessage::Unknown => {
                tracing::debug!("rendezvous: ignoring unknown message type");
            }
        }
    }
}

async fn send(link: &SignalingConnection, message: &ClientMessage) -> Result<(), MeshError> {
    link.send_json(message).await.map_err(MeshError::from)
}

/// Register the local device (if any) and ask for the peer list.
async fn announce(shared: &Shared, link: &SignalingConnection) {
    if let Some(device) = shared.local() {
        let name = device.device_name.clone();
        match send(link, &ClientMessage::Register { device }).await {
            Ok(()) => shared.table.emit(DiscoveryEvent::ServiceRegistered(name)),
            Err(e) => {
                tracing::warn!("rendezvous: register failed: {e}");
                shared
                    .table
                    .emit(DiscoveryEvent::ServiceRegistrationFailed(e.to_string()));
            }
        }
    }
    if let Err(e) = send(link, &ClientMessage::GetPeers).await {
        tracing::warn!("rendezvous: get-peers failed: {e}");
    }
}

async fn refresh(shared: &Shared, link: &SignalingConnection) {
    if let Some(device_id) = shared.local_id() {
        if let Err(e) = send(link, &ClientMessage::Heartbeat { device_id }).await {
            tracing::debug!("rendezvous: heartbeat failed: {e}");
            return;
        }
    }
    if let Err(e) = send(link, &ClientMessage::GetPeers).await {
        tracing::debug!("rendezvous: refresh failed: {e}");
    }
}

// ── Run loop ────────────────────────────────────────────────────────────

enum LinkEnd {
    Cancelled,
    Failed,
}

struct RunParams {
    url: String,
    refresh_interval: Duration,
    retry_delay: Duration,
}

async fn run(
    shared: Arc<Shared>,
    link: Arc<SignalingConnection>,
    params: RunParams,
    cancel: CancellationToken,
) {
    let mut events = link.subscribe();

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = link.connect_to_server(&params.url) => result,
        };
        let end = match connected {
            Ok(()) => {
                tracing::info!("rendezvous: connected to {}", params.url);
                serve(&shared, &link, &mut events, params.refresh_interval, &cancel).await
            }
            Err(e) => {
                tracing::warn!("rendezvous: connect to {} failed: {e}", params.url);
                LinkEnd::Failed
            }
        };
        if let LinkEnd::Cancelled = end {
            break;
        }

        tracing::info!(
            "rendezvous: retrying in {} ms",
            params.retry_delay.as_millis()
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(params.retry_delay) => {}
        }
        // Drop events from the dead link before dialing again.
        events = events.resubscribe();
    }

    link.disconnect();
}

async fn serve(
    shared: &Shared,
    link: &SignalingConnection,
    events: &mut broadcast::Receiver<SignalingConnectionEvent>,
    refresh_interval: Duration,
    cancel: &CancellationToken,
) -> LinkEnd {
    let start = tokio::time::Instant::now() + refresh_interval;
    let mut ticker = tokio::time::interval_at(start, refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return LinkEnd::Cancelled,
            _ = ticker.tick() => refresh(shared, link).await,
            event = events.recv() => match event {
                Ok(SignalingConnectionEvent::Connected { .. }) => announce(shared, link).await,
                Ok(SignalingConnectionEvent::Message { text }) => shared.handle_frame(&text),
                Ok(SignalingConnectionEvent::ServerError { message }) => {
                    tracing::warn!("rendezvous: server error: {message}");
                }
                Ok(SignalingConnectionEvent::Reconnecting { attempt, delay_ms }) => {
                    tracing::debug!("rendezvous: link reconnecting (attempt {attempt}, {delay_ms} ms)");
                }
                Ok(SignalingConnectionEvent::MaxReconnectReached)
                | Ok(SignalingConnectionEvent::ConnectionFailed { .. })
                | Ok(SignalingConnectionEvent::Disconnected) => return LinkEnd::Failed,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("rendezvous: missed {n} link events");
                }
                Err(broadcast::error::RecvError::Closed) => return LinkEnd::Cancelled,
            },
        }
    }
}

// ── Backend ─────────────────────────────────────────────────────────────

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Discovery through a rendezvous server.
pub struct SignalingRendezvousBackend {
    config: DiscoveryConfig,
    link: Arc<SignalingConnection>,
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<Running>>,
    discovering: AtomicBool,
}

impl SignalingRendezvousBackend {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        signaling: SignalingConfig,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            config,
            link: Arc::new(SignalingConnection::new(transport, signaling)),
            shared: Arc::new(Shared {
                table: DeviceTable::new(),
                local: Mutex::new(None),
            }),
            running: tokio::sync::Mutex::new(None),
            discovering: AtomicBool::new(false),
        }
    }

    /// Backend over WebSockets.
    pub fn websocket(signaling: SignalingConfig, config: DiscoveryConfig) -> Self {
        Self::new(Arc::new(WsTransport::new()), signaling, config)
    }

    /// State of the signaling link. The link itself stays private: only the
    /// run loop may drive it.
    pub fn link_state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn watch_link_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.watch_state()
    }

    pub fn current_devices(&self) -> DeviceList {
        self.shared.table.snapshot()
    }
}

#[async_trait::async_trait]
impl DiscoveryBackend for SignalingRendezvousBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SignalingRendezvous
    }

    async fn start_discovery(&self) -> Result<(), MeshError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("rendezvous: discovery already running");
            return Ok(());
        }

        let url = match self.config.parsed_signaling_url() {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("rendezvous: cannot start: {e}");
                self.shared.table.emit(DiscoveryEvent::Failed(e.to_string()));
                return Err(e);
            }
        };

        tracing::info!("rendezvous: discovering via {url}");
        self.shared.table.emit(DiscoveryEvent::Started);

        let cancel = CancellationToken::new();
        let params = RunParams {
            url: url.to_string(),
            refresh_interval: self.config.refresh_interval,
            retry_delay: self.config.transport_retry_delay,
        };
        let task = tokio::spawn(run(
            self.shared.clone(),
            self.link.clone(),
            params,
            cancel.clone(),
        ));
        *running = Some(Running { cancel, task });
        self.discovering.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop_discovery(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            tracing::warn!("rendezvous: run loop ended abnormally: {e}");
        }
        self.link.disconnect();
        self.discovering.store(false, Ordering::Release);
        self.shared.table.clear();

        tracing::info!("rendezvous: stopped");
        self.shared.table.emit(DiscoveryEvent::Stopped);
    }

    async fn register_service(&self, device: &Device) -> Result<(), MeshError> {
        *self
            .shared
            .local
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(device.clone());
        self.shared.table.remove(&device.device_id);

        if self.link.state() != ConnectionState::Connected {
            tracing::debug!("rendezvous: registration deferred until connected");
            return Ok(());
        }

        let message = ClientMessage::Register {
            device: device.clone(),
        };
        match send(&self.link, &message).await {
            Ok(()) => {
                self.shared
                    .table
                    .emit(DiscoveryEvent::ServiceRegistered(device.device_name.clone()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!("rendezvous: register failed: {e}");
                self.shared
                    .table
                    .emit(DiscoveryEvent::ServiceRegistrationFailed(e.to_string()));
                Err(MeshError::Registration(e.to_string()))
            }
        }
    }

    async fn unregister_service(&self) {
        let previous = self
            .shared
            .local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(device) = previous else {
            return;
        };
        if self.link.state() == ConnectionState::Connected {
            let message = ClientMessage::Unregister {
                device_id: device.device_id.clone(),
            };
            if let Err(e) = send(&self.link, &message).await {
                tracing::warn!("rendezvous: unregister failed: {e}");
            }
        }
        tracing::info!("rendezvous: withdrew {}", device.device_id);
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
