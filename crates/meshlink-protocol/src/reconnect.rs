/// ReconnectScheduler: delayed, cancelable peer reconnects.
///
/// At most one pending task per device. A task carries only a device id, so
/// the scheduler keeps a cache of last-known device metadata and refuses to
/// schedule for devices it has never seen.
///
/// Every task gets a fresh token. A timer or an attempt only acts while its
/// token is still the one stored for the device, so cancel and replace win
/// over a timer that has not fired yet. Once a timer has fired, the attempt
/// runs to completion; its outcome is applied only if nobody cancelled or
/// replaced the task in the meantime.
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

use crate::heartbeat::HeartbeatTracker;
use crate::types::{Device, DeviceId};

const STATUS_CHANNEL_CAPACITY: usize = 256;

// ── Public types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconnectReason {
    HeartbeatTimeout,
    ConnectionLost,
}

/// The pending reconnect for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectTask {
    pub device_id: DeviceId,
    pub reason: ReconnectReason,
    pub delay_ms: u64,
    pub scheduled_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconnectStatus {
    Scheduled,
    Success,
    Failed,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectStatusEvent {
    pub device_id: DeviceId,
    pub status: ReconnectStatus,
}

/// Application-supplied reconnect. `Ok` means the peer is reachable again.
#[async_trait::async_trait]
pub trait ReconnectAction: Send + Sync + 'static {
    async fn reconnect(&self, device: Device) -> anyhow::Result<()>;
}

struct FnAction<F>(F);

#[async_trait::async_trait]
impl<F, Fut> ReconnectAction for FnAction<F>
where
    F: Fn(Device) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn reconnect(&self, device: Device) -> anyhow::Result<()> {
        (self.0)(device).await
    }
}

/// Wrap a closure as a [`ReconnectAction`].
///
/// ```rust
/// use meshlink_protocol::reconnect_fn;
///
/// let action = reconnect_fn(|device| async move {
///     println!("dialing {}", device.device_id);
///     Ok::<_, anyhow::Error>(())
/// });
/// # let _ = action;
/// ```
pub fn reconnect_fn<F, Fut>(f: F) -> Arc<dyn ReconnectAction>
where
    F: Fn(Device) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnAction(f))
}

// ── Internals ───────────────────────────────────────────────────────────

struct Pending {
    task: ReconnectTask,
    token: u64,
    /// Set once the timer fired and the attempt is running.
    in_flight: bool,
    timer: Option<AbortHandle>,
}

impl Pending {
    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    heartbeat: Arc<HeartbeatTracker>,
    cache: DashMap<DeviceId, Device>,
    pending: DashMap<DeviceId, Pending>,
    action: RwLock<Option<Arc<dyn ReconnectAction>>>,
    paused: AtomicBool,
    running: AtomicBool,
    next_token: AtomicU64,
    events: broadcast::Sender<ReconnectStatusEvent>,
    timeout_watch: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn emit(&self, device_id: &DeviceId, status: ReconnectStatus) {
        // No subscribers is fine.
        let _ = self.events.send(ReconnectStatusEvent {
            device_id: device_id.clone(),
            status,
        });
    }

    fn token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn action(&self) -> Option<Arc<dyn ReconnectAction>> {
        self.action
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn new_task(device_id: &DeviceId, reason: ReconnectReason, delay: Duration) -> ReconnectTask {
        ReconnectTask {
            device_id: device_id.clone(),
            reason,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            scheduled_at: Instant::now(),
        }
    }

    /// Attach the timer handle if the task is still the current one.
    fn arm(self: &Arc<Self>, device_id: &DeviceId, token: u64, delay: Duration) {
        let handle = tokio::spawn(fire_after(self.clone(), device_id.clone(), token, delay));
        match self.pending.get_mut(device_id) {
            Some(mut pending) if pending.token == token => {
                pending.timer = Some(handle.abort_handle());
            }
            _ => handle.abort(),
        }
    }

    fn schedule(self: &Arc<Self>, device_id: &DeviceId, delay: Duration, reason: ReconnectReason) {
        let token = self.token();
        let replaced = self.pending.insert(
            device_id.clone(),
            Pending {
                task: Self::new_task(device_id, reason, delay),
                token,
                in_flight: false,
                timer: None,
            },
        );
        if let Some(mut old) = replaced {
            old.abort_timer();
            tracing::debug!("reconnect: replaced pending task for {device_id}");
        }

        tracing::info!(
            "reconnect: {device_id} in {} ms ({reason:?})",
            delay.as_millis()
        );
        self.emit(device_id, ReconnectStatus::Scheduled);
        self.arm(device_id, token, delay);
    }

    /// Claim the task for an attempt. Fails if it was cancelled, replaced
    /// or is already running.
    fn claim(&self, device_id: &DeviceId, token: u64) -> bool {
        match self.pending.get_mut(device_id) {
            Some(mut pending) if pending.token == token && !pending.in_flight => {
                pending.in_flight = true;
                pending.timer = None;
                true
            }
            _ => false,
        }
    }

    async fn attempt(self: Arc<Self>, device: Device, token: u64) -> ReconnectStatus {
        let device_id = device.device_id.clone();
        let Some(action) = self.action() else {
            self.pending.remove_if(&device_id, |_, p| p.token == token);
            tracing::debug!("reconnect: no action installed, dropping task for {device_id}");
            return ReconnectStatus::Failed;
        };

        tracing::debug!("reconnect: attempting {device_id}");
        // Own task so a panicking action counts as a failed attempt.
        let outcome = match tokio::spawn(async move { action.reconnect(device).await }).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("reconnect action aborted: {e}")),
        };

        match outcome {
            Ok(()) => self.succeeded(&device_id, token),
            Err(reason) => self.failed(&device_id, token, reason),
        }
    }

    fn succeeded(&self, device_id: &DeviceId, token: u64) -> ReconnectStatus {
        let current = self
            .pending
            .remove_if(device_id, |_, p| p.token == token)
            .is_some();
        if !self.running.load(Ordering::Acquire) {
            tracing::debug!("reconnect: {device_id} reconnected after release");
            return ReconnectStatus::Success;
        }
        if !current {
            tracing::debug!("reconnect: {device_id} reconnected after its task was cancelled");
        }
        tracing::info!("reconnect: {device_id} reconnected");
        self.emit(device_id, ReconnectStatus::Success);
        ReconnectStatus::Success
    }

    fn failed(self: &Arc<Self>, device_id: &DeviceId, token: u64, reason: String) -> ReconnectStatus {
        let running = self.running.load(Ordering::Acquire);

        let retry = {
            let Some(mut pending) = self.pending.get_mut(device_id) else {
                tracing::debug!("reconnect: {device_id} failed after cancel: {reason}");
                return ReconnectStatus::Failed;
            };
            if pending.token != token || !running {
                tracing::debug!("reconnect: stale failure for {device_id}: {reason}");
                return ReconnectStatus::Failed;
            }

            if self.heartbeat.can_retry_reconnect(device_id) {
                let attempts = self.heartbeat.increment_reconnect_attempts(device_id);
                let delay = self.heartbeat.calculate_reconnect_delay(device_id);
                let fresh = self.token();
                pending.task = Self::new_task(device_id, pending.task.reason, delay);
                pending.token = fresh;
                pending.in_flight = false;
                tracing::warn!(
                    "reconnect: {device_id} attempt {attempts} failed: {reason}, retrying in {} ms",
                    delay.as_millis()
                );
                Some((fresh, delay))
            } else {
                None
            }
        };

        match retry {
            Some((fresh, delay)) => {
                self.emit(device_id, ReconnectStatus::Failed);
                self.emit(device_id, ReconnectStatus::Scheduled);
                self.arm(device_id, fresh, delay);
                ReconnectStatus::Failed
            }
            None => {
                self.pending.remove_if(device_id, |_, p| p.token == token);
                tracing::warn!("reconnect: {device_id} exhausted: {reason}");
                self.emit(device_id, ReconnectStatus::Exhausted);
                ReconnectStatus::Exhausted
            }
        }
    }
}

async fn fire_after(inner: Arc<Inner>, device_id: DeviceId, token: u64, delay: Duration) {
    tokio::time::sleep(delay).await;

    if !inner.claim(&device_id, token) {
        tracing::debug!("reconnect: timer for {device_id} superseded");
        return;
    }
    let Some(device) = inner.cache.get(&device_id).map(|d| d.clone()) else {
        inner.pending.remove_if(&device_id, |_, p| p.token == token);
        tracing::debug!("reconnect: {device_id} left the cache, dropping task");
        return;
    };
    inner.attempt(device, token).await;
}

// ── ReconnectScheduler ──────────────────────────────────────────────────

/// Schedules and runs peer reconnects. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ReconnectScheduler {
    inner: Arc<Inner>,
}

impl ReconnectScheduler {
    pub fn new(heartbeat: Arc<HeartbeatTracker>) -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                heartbeat,
                cache: DashMap::new(),
                pending: DashMap::new(),
                action: RwLock::new(None),
                paused: AtomicBool::new(false),
                running: AtomicBool::new(false),
                next_token: AtomicU64::new(0),
                events,
                timeout_watch: Mutex::new(None),
            }),
        }
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatTracker> {
        &self.inner.heartbeat
    }

    /// Install the reconnect action and start accepting schedule requests.
    pub fn start(&self, action: Arc<dyn ReconnectAction>) {
        *self
            .inner
            .action
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(action);
        self.inner.running.store(true, Ordering::Release);
        tracing::info!("reconnect: scheduler started");
    }

    /// Cancel every pending task, drop the action and the device cache.
    pub fn release(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(watch) = self
            .inner
            .timeout_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watch.abort();
        }
        for mut pending in self.inner.pending.iter_mut() {
            pending.abort_timer();
        }
        self.inner.pending.clear();
        self.inner.cache.clear();
        *self
            .inner
            .action
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        tracing::info!("reconnect: scheduler released");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    // ── Device cache ────────────────────────────────────────────────

    pub fn cache_device(&self, device: Device) {
        self.inner.cache.insert(device.device_id.clone(), device);
    }

    pub fn remove_device_cache(&self, device_id: &DeviceId) -> Option<Device> {
        self.inner.cache.remove(device_id).map(|(_, d)| d)
    }

    pub fn get_cached_device(&self, device_id: &DeviceId) -> Option<Device> {
        self.inner.cache.get(device_id).map(|d| d.clone())
    }

    // ── Pause ───────────────────────────────────────────────────────

    /// Block new scheduling. Pending timers keep running.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
        tracing::info!("reconnect: paused");
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
        tracing::info!("reconnect: resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Schedule (or replace) the reconnect for `device_id`.
    ///
    /// No-op returning false when paused, not started, or the device is
    /// not cached.
    pub fn schedule_reconnect(
        &self,
        device_id: &DeviceId,
        delay: Duration,
        reason: ReconnectReason,
    ) -> bool {
        if !self.is_running() {
            tracing::debug!("reconnect: not started, ignoring {device_id}");
            return false;
        }
        if self.is_paused() {
            tracing::debug!("reconnect: paused, ignoring {device_id}");
            return false;
        }
        if !self.inner.cache.contains_key(device_id) {
            tracing::debug!("reconnect: {device_id} not cached, ignoring");
            return false;
        }
        self.inner.schedule(device_id, delay, reason);
        true
    }

    /// Schedule a `ConnectionLost` reconnect with the tracker's backoff delay.
    pub fn on_connection_lost(&self, device_id: &DeviceId) -> bool {
        let delay = self.inner.heartbeat.calculate_reconnect_delay(device_id);
        self.schedule_reconnect(device_id, delay, ReconnectReason::ConnectionLost)
    }

    /// Remove the pending task, if any, and reset the device's attempts.
    /// Returns whether a task was removed.
    pub fn cancel_reconnect(&self, device_id: &DeviceId) -> bool {
        let removed = match self.inner.pending.remove(device_id) {
            Some((_, mut pending)) => {
                pending.abort_timer();
                true
            }
            None => false,
        };
        self.inner.heartbeat.reset_reconnect_attempts(device_id);
        if removed {
            tracing::info!("reconnect: cancelled {device_id}");
        }
        removed
    }

    /// Cancel any pending timer and attempt right away.
    ///
    /// Resolves with the outcome once the attempt finished. `None` when the
    /// scheduler is not started or the device is not cached.
    pub async fn reconnect_now(&self, device_id: &DeviceId) -> Option<ReconnectStatus> {
        if !self.is_running() {
            return None;
        }
        let device = self.get_cached_device(device_id)?;

        let token = self.inner.token();
        let reason = self
            .inner
            .pending
            .get(device_id)
            .map(|p| p.task.reason)
            .unwrap_or(ReconnectReason::ConnectionLost);
        let replaced = self.inner.pending.insert(
            device_id.clone(),
            Pending {
                task: Inner::new_task(device_id, reason, Duration::ZERO),
                token,
                in_flight: true,
                timer: None,
            },
        );
        if let Some(mut old) = replaced {
            old.abort_timer();
        }

        Some(self.inner.clone().attempt(device, token).await)
    }

    /// Schedule a `HeartbeatTimeout` reconnect for every timeout the
    /// tracker reports, until [`release`](Self::release).
    pub fn watch_timeouts(&self) {
        let mut timeouts = self.inner.heartbeat.subscribe_timeouts();
        let inner = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            loop {
                match timeouts.recv().await {
                    Ok(timeout) => {
                        let Some(inner) = inner.upgrade() else { break };
                        let scheduler = ReconnectScheduler { inner };
                        let id = &timeout.device_id;
                        let delay = scheduler.inner.heartbeat.calculate_reconnect_delay(id);
                        scheduler.schedule_reconnect(id, delay, ReconnectReason::HeartbeatTimeout);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("reconnect: missed {n} timeout events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let previous = self
            .inner
            .timeout_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn get_pending_reconnect_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Devices with a pending task, sorted.
    pub fn get_pending_reconnect_device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn pending_task(&self, device_id: &DeviceId) -> Option<ReconnectTask> {
        self.inner.pending.get(device_id).map(|p| p.task.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectStatusEvent> {
        self.inner.events.subscribe()
    }
}
