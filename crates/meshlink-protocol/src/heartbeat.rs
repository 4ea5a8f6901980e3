/// HeartbeatTracker: peer liveness monitoring.
///
/// Records heartbeats per device, classifies silence against a fixed
/// connection timeout, and owns the per-device reconnect-attempt counters
/// the reconnect scheduler consults for backoff.
///
/// A device that crosses the timeout is reported once on the timeout
/// stream. Recording a heartbeat re-arms it, so a later silence is
/// reported again.
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backoff::backoff_delay;
use crate::config::HeartbeatConfig;
use crate::types::{DeviceId, MessageEnvelope, MessageType};

const TIMEOUT_CHANNEL_CAPACITY: usize = 64;

/// Snapshot of one tracked device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub device_id: DeviceId,
    pub last_active_at: Instant,
    pub reconnect_attempts: u32,
}

/// Emitted when a tracked device first crosses the connection timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTimeout {
    pub device_id: DeviceId,
    pub silent_for: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Liveness {
    last_active_at: Instant,
    /// Set once the timeout has been reported; cleared by a heartbeat.
    timed_out: bool,
}

impl Liveness {
    fn at(now: Instant) -> Self {
        Self {
            last_active_at: now,
            timed_out: false,
        }
    }
}

/// Tracks device liveness via heartbeat timestamps.
pub struct HeartbeatTracker {
    config: HeartbeatConfig,
    liveness: DashMap<DeviceId, Liveness>,
    /// Kept apart from liveness so a peer can be retried without being
    /// heartbeat-tracked.
    attempts: DashMap<DeviceId, u32>,
    timeouts: broadcast::Sender<ConnectionTimeout>,
    checker: Mutex<Option<CancellationToken>>,
}

impl Default for HeartbeatTracker {
    fn default() -> Self {
        Self::new(HeartbeatConfig::new())
    }
}

impl HeartbeatTracker {
    pub fn new(config: HeartbeatConfig) -> Self {
        let (timeouts, _) = broadcast::channel(TIMEOUT_CHANNEL_CAPACITY);
        Self {
            config,
            liveness: DashMap::new(),
            attempts: DashMap::new(),
            timeouts,
            checker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    // ── Membership ──────────────────────────────────────────────────

    /// Start tracking a device. Registering a tracked device is a no-op.
    pub fn register_device(&self, device_id: &DeviceId) {
        self.register_device_at(device_id, Instant::now());
    }

    /// Register with a specific timestamp (for testing).
    pub fn register_device_at(&self, device_id: &DeviceId, now: Instant) {
        self.liveness
            .entry(device_id.clone())
            .or_insert_with(|| Liveness::at(now));
    }

    /// Stop tracking a device and drop its reconnect counter.
    pub fn unregister_device(&self, device_id: &DeviceId) -> bool {
        self.attempts.remove(device_id);
        self.liveness.remove(device_id).is_some()
    }

    /// Whether the device is tracked. Silence does not untrack a device;
    /// see [`timed_out_device_ids`](Self::timed_out_device_ids).
    pub fn is_device_active(&self, device_id: &DeviceId) -> bool {
        self.liveness.contains_key(device_id)
    }

    /// All tracked devices, sorted.
    pub fn get_active_device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.liveness.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn tracked_count(&self) -> usize {
        self.liveness.len()
    }

    pub fn record(&self, device_id: &DeviceId) -> Option<HeartbeatRecord> {
        let liveness = *self.liveness.get(device_id)?;
        Some(HeartbeatRecord {
            device_id: device_id.clone(),
            last_active_at: liveness.last_active_at,
            reconnect_attempts: self.reconnect_attempts(device_id),
        })
    }

    // ── Heartbeats ──────────────────────────────────────────────────

    /// Record a heartbeat. Unknown devices are registered on the fly.
    /// Always resets the device's reconnect attempts to 0.
    pub fn record_heartbeat(&self, device_id: &DeviceId) {
        self.record_heartbeat_at(device_id, Instant::now());
    }

    /// Record a heartbeat with a specific timestamp (for testing).
    pub fn record_heartbeat_at(&self, device_id: &DeviceId, now: Instant) {
        let previous = self.liveness.insert(device_id.clone(), Liveness::at(now));
        if previous.is_some_and(|p| p.timed_out) {
            tracing::debug!("heartbeat: {device_id} is alive again");
        }
        self.reset_reconnect_attempts(device_id);
    }

    /// Record a heartbeat if `message` is heartbeat-typed. Any other type
    /// returns false and changes nothing.
    pub fn handle_heartbeat_message(&self, message: &MessageEnvelope) -> bool {
        if message.msg_type != MessageType::Heartbeat {
            return false;
        }
        self.record_heartbeat(&message.from);
        true
    }

    /// [`handle_heartbeat_message`](Self::handle_heartbeat_message) over raw
    /// JSON. Unparseable input is not a heartbeat.
    pub fn handle_heartbeat_bytes(&self, bytes: &[u8]) -> bool {
        match serde_json::from_slice::<MessageEnvelope>(bytes) {
            Ok(message) => self.handle_heartbeat_message(&message),
            Err(e) => {
                tracing::debug!("heartbeat: dropping malformed message: {e}");
                false
            }
        }
    }

    /// The heartbeat envelope the local device sends to its peers.
    pub fn heartbeat_message(local_id: &DeviceId) -> MessageEnvelope {
        MessageEnvelope::new(local_id.clone(), MessageType::Heartbeat, serde_json::Value::Null)
    }

    // ── Reconnect bookkeeping ───────────────────────────────────────

    /// Increment and return the new count (first call returns 1).
    pub fn increment_reconnect_attempts(&self, device_id: &DeviceId) -> u32 {
        let mut attempts = self.attempts.entry(device_id.clone()).or_insert(0);
        *attempts = attempts.saturating_add(1);
        *attempts
    }

    pub fn reset_reconnect_attempts(&self, device_id: &DeviceId) {
        self.attempts.remove(device_id);
    }

    pub fn reconnect_attempts(&self, device_id: &DeviceId) -> u32 {
        self.attempts.get(device_id).map(|a| *a).unwrap_or(0)
    }

    pub fn can_retry_reconnect(&self, device_id: &DeviceId) -> bool {
        self.reconnect_attempts(device_id) < self.config.max_attempts
    }

    /// `base * 2^attempts`, capped. Attempt 0 yields exactly the base delay.
    pub fn calculate_reconnect_delay(&self, device_id: &DeviceId) -> Duration {
        backoff_delay(
            self.config.base_delay,
            self.reconnect_attempts(device_id),
            self.config.max_delay,
        )
    }

    // ── Timeouts ────────────────────────────────────────────────────

    /// Stream of first-time timeouts.
    pub fn subscribe_timeouts(&self) -> broadcast::Receiver<ConnectionTimeout> {
        self.timeouts.subscribe()
    }

    /// Check every tracked device now. See [`check_timeouts_at`](Self::check_timeouts_at).
    pub fn check_timeouts(&self) -> Vec<ConnectionTimeout> {
        self.check_timeouts_at(Instant::now())
    }

    /// Report devices that crossed the timeout since the last check and
    /// publish them on the timeout stream.
    pub fn check_timeouts_at(&self, now: Instant) -> Vec<ConnectionTimeout> {
        let mut crossed = vec![];

        for mut entry in self.liveness.iter_mut() {
            let silent_for = now.saturating_duration_since(entry.last_active_at);
            if silent_for >= self.config.connection_timeout && !entry.timed_out {
                entry.timed_out = true;
                crossed.push(ConnectionTimeout {
                    device_id: entry.key().clone(),
                    silent_for,
                });
            }
        }

        for timeout in &crossed {
            tracing::info!(
                "heartbeat: {} timed out after {} ms",
                timeout.device_id,
                timeout.silent_for.as_millis()
            );
            // No subscribers is fine.
            let _ = self.timeouts.send(timeout.clone());
        }
        crossed
    }

    /// Devices currently past the timeout, sorted.
    pub fn timed_out_device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .liveness
            .iter()
            .filter(|e| e.timed_out)
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    // ── Periodic check ──────────────────────────────────────────────

    /// Spawn the periodic timeout check (one tick per heartbeat interval).
    /// Returns false if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut checker = self.checker.lock().unwrap_or_else(PoisonError::into_inner);
        if checker.is_some() {
            return false;
        }
        let cancel = CancellationToken::new();
        *checker = Some(cancel.clone());

        let period = self.config.heartbeat_interval;
        tokio::spawn(run_checker(Arc::downgrade(self), period, cancel));
        tracing::info!("heartbeat: checking every {} ms", period.as_millis());
        true
    }

    /// Stop the periodic check. Tracked state is kept.
    pub fn stop(&self) {
        let taken = self
            .checker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = taken {
            cancel.cancel();
            tracing::info!("heartbeat: stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.checker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for HeartbeatTracker {
    fn drop(&mut self) {
        if let Some(cancel) = self
            .checker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
    }
}

async fn run_checker(tracker: Weak<HeartbeatTracker>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(tracker) = tracker.upgrade() else { break };
                tracker.check_timeouts();
            }
        }
    }
}
