use std::time::Duration;

/// Default connect timeout for the signaling link.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout. A link that stays silent this long is treated as lost.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of automatic reconnects after an established link drops.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Default first reconnect delay (doubles per attempt).
pub const DEFAULT_BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Upper bound on a single reconnect delay.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// Port used when `connect_to_server` is given a bare host.
pub const DEFAULT_SIGNALING_PORT: u16 = 8080;

const CONNECT_TIMEOUT_RANGE: (Duration, Duration) =
    (Duration::from_secs(5), Duration::from_secs(30));
const READ_TIMEOUT_RANGE: (Duration, Duration) =
    (Duration::from_secs(15), Duration::from_secs(60));
const RECONNECT_ATTEMPTS_RANGE: (u32, u32) = (2, 10);
const BASE_DELAY_RANGE: (Duration, Duration) =
    (Duration::from_millis(500), Duration::from_secs(5));

/// Configuration for a [`SignalingConnection`](crate::SignalingConnection).
///
/// Setters clamp into the supported tuning ranges:
///
/// ```rust
/// use meshlink_transport::SignalingConfig;
/// use std::time::Duration;
///
/// let config = SignalingConfig::new()
///     .connect_timeout(Duration::from_secs(60))
///     .max_reconnect_attempts(3);
/// assert_eq!(config.connect_timeout_value(), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) max_reconnect_attempts: u32,
    pub(crate) base_reconnect_delay: Duration,
    pub(crate) max_reconnect_delay: Duration,
    pub(crate) default_port: u16,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingConfig {
    /// Create a config with defaults.
    ///
    /// `MESHLINK_SIGNALING_PORT`, when set to a valid port, replaces the
    /// default port.
    pub fn new() -> Self {
        let default_port = std::env::var("MESHLINK_SIGNALING_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SIGNALING_PORT);

        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_reconnect_delay: DEFAULT_BASE_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            default_port,
        }
    }

    /// Set the connect timeout (clamped to 5–30 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout.clamp(CONNECT_TIMEOUT_RANGE.0, CONNECT_TIMEOUT_RANGE.1);
        self
    }

    /// Set the read timeout (clamped to 15–60 s).
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout.clamp(READ_TIMEOUT_RANGE.0, READ_TIMEOUT_RANGE.1);
        self
    }

    /// Set the automatic reconnect budget (clamped to 2–10).
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts =
            attempts.clamp(RECONNECT_ATTEMPTS_RANGE.0, RECONNECT_ATTEMPTS_RANGE.1);
        self
    }

    /// Set the first reconnect delay (clamped to 500 ms–5 s).
    pub fn base_reconnect_delay(mut self, delay: Duration) -> Self {
        self.base_reconnect_delay = delay.clamp(BASE_DELAY_RANGE.0, BASE_DELAY_RANGE.1);
        self
    }

    /// Set the cap applied to doubled reconnect delays.
    pub fn max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay.max(self.base_reconnect_delay);
        self
    }

    /// Set the port used for bare hosts.
    pub fn default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn connect_timeout_value(&self) -> Duration {
        self.connect_timeout
    }

    pub fn read_timeout_value(&self) -> Duration {
        self.read_timeout
    }

    pub fn max_reconnect_attempts_value(&self) -> u32 {
        self.max_reconnect_attempts
    }

    pub fn base_reconnect_delay_value(&self) -> Duration {
        self.base_reconnect_delay
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub(crate) fn reconnect_delay(&self, attempt: u32) -> Duration {
        crate::backoff::backoff_delay(
            self.base_reconnect_delay,
            attempt.saturating_sub(1),
            self.max_reconnect_delay,
        )
    }
}
