use std::time::Duration;

use url::Url;

use crate::error::MeshError;

// ── Constants ────────────────────────────────────────────────────────────

/// Liveness check period (5 seconds).
pub const HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// A device silent for this long is reported as timed out (15 seconds).
pub const CONNECTION_TIMEOUT_MS: u64 = 15_000;

/// First peer reconnect delay.
pub const BASE_DELAY_MS: u64 = 1_000;

/// Cap on a single peer reconnect delay.
pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Peer reconnect attempts before a cycle is exhausted.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// DNS-SD service type advertised on the LAN.
pub const DEFAULT_SERVICE_TYPE: &str = "_meshlink._tcp.local.";

/// Port advertised for the local device's data channel.
pub const DEFAULT_SERVICE_PORT: u16 = 47_800;

/// Period of the rendezvous heartbeat-and-refresh loop.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Fixed delay before the rendezvous backend re-dials a failed link.
pub const DEFAULT_TRANSPORT_RETRY_DELAY: Duration = Duration::from_secs(5);

// ── HeartbeatConfig ─────────────────────────────────────────────────────

/// Liveness and peer-reconnect tuning for
/// [`HeartbeatTracker`](crate::HeartbeatTracker).
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub(crate) heartbeat_interval: Duration,
    pub(crate) connection_timeout: Duration,
    pub(crate) base_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) max_attempts: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatConfig {
    pub fn new() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            connection_timeout: Duration::from_millis(CONNECTION_TIMEOUT_MS),
            base_delay: Duration::from_millis(BASE_DELAY_MS),
            max_delay: Duration::from_millis(MAX_RECONNECT_DELAY_MS),
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }

    /// Period of the timeout check (at least 1 ms).
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self.max_delay = self.max_delay.max(delay);
        self
    }

    /// Cap on a single delay. Never below the base delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay.max(self.base_delay);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

// ── DiscoveryConfig ─────────────────────────────────────────────────────

/// Settings shared by the discovery backends.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub(crate) service_type: String,
    pub(crate) service_port: u16,
    pub(crate) signaling_url: Option<String>,
    pub(crate) refresh_interval: Duration,
    pub(crate) transport_retry_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryConfig {
    /// Defaults, with the rendezvous url taken from `MESHLINK_SIGNALING_URL`
    /// when set.
    pub fn new() -> Self {
        let signaling_url = std::env::var("MESHLINK_SIGNALING_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            service_port: DEFAULT_SERVICE_PORT,
            signaling_url,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            transport_retry_delay: DEFAULT_TRANSPORT_RETRY_DELAY,
        }
    }

    pub fn service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    pub fn service_port(mut self, port: u16) -> Self {
        self.service_port = port;
        self
    }

    pub fn signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = Some(url.into());
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn transport_retry_delay(mut self, delay: Duration) -> Self {
        self.transport_retry_delay = delay.max(Duration::from_millis(1));
        self
    }

    /// Parse the rendezvous url. Must be `ws://` or `wss://` with a host.
    pub fn parsed_signaling_url(&self) -> Result<Url, MeshError> {
        let raw = self
            .signaling_url
            .as_deref()
            .ok_or_else(|| MeshError::InvalidConfig("no signaling url configured".into()))?;
        let url = Url::parse(raw)
            .map_err(|e| MeshError::InvalidConfig(format!("signaling url {raw}: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(MeshError::InvalidConfig(format!(
                "signaling url {raw}: scheme must be ws or wss"
            )));
        }
        if url.host_str().is_none() {
            return Err(MeshError::InvalidConfig(format!(
                "signaling url {raw}: missing host"
            )));
        }
        Ok(url)
    }
}
