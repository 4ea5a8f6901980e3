/// Signaling link state machine.
///
/// Owns the lifecycle of one socket to a rendezvous server:
/// Disconnected → Connecting → Connected, Connecting → Failed, and on an
/// established link dropping: Reconnecting(1..=max) → Connected or
/// Failed("max reconnect reached"). `disconnect()` returns to Disconnected
/// from any state.
///
/// Every connect opens a *session*. Background tasks carry their session id
/// and only apply transitions while that session is still current, so a
/// late timer or connect result from a torn-down session is ignored.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::socket::{FrameSink, FrameStream, SignalingSocket, SignalingTransport, WsTransport};
use crate::{SignalingConfig, TransportError};

/// Reason recorded when the automatic reconnect budget runs out.
pub const MAX_RECONNECT_REACHED: &str = "max reconnect reached";

const EVENT_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 64;

// ── State & events ──────────────────────────────────────────────────

/// Current state of the signaling link. Exactly one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, and the state after `disconnect()`.
    Disconnected,
    /// Waiting to be addressed by a peer instead of dialing.
    Listening,
    Connecting,
    Connected,
    /// Automatic reconnect in progress (1-based attempt).
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

/// Events emitted by a [`SignalingConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingConnectionEvent {
    Connected { host: String, port: u16 },
    ConnectionFailed { reason: String },
    Disconnected,
    Reconnecting { attempt: u32, delay_ms: u64 },
    MaxReconnectReached,
    /// The server sent an `{"type":"error"}` frame.
    ServerError { message: String },
    /// Any other inbound text frame.
    Message { text: String },
}

/// Where the link points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub host: String,
    pub port: u16,
    pub url: String,
}

/// Resolve `host`, `host:port` or a full `ws://`/`wss://` url.
pub fn resolve_target(host: &str, default_port: u16) -> Result<ServerTarget, TransportError> {
    let raw = host.trim();
    if raw.is_empty() {
        return Err(TransportError::InvalidUrl("empty host".into()));
    }

    let has_scheme = raw.contains("://");
    let candidate = if has_scheme {
        raw.to_string()
    } else {
        format!("ws://{raw}")
    };
    let mut url =
        Url::parse(&candidate).map_err(|e| TransportError::InvalidUrl(format!("{raw}: {e}")))?;

    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(TransportError::InvalidUrl(format!(
            "{raw}: unsupported scheme {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl(format!("{raw}: missing host")))?
        .to_string();

    if url.port().is_none() && !has_scheme {
        url.set_port(Some(default_port))
            .map_err(|_| TransportError::InvalidUrl(format!("{raw}: cannot set port")))?;
    }
    let port = url.port_or_known_default().unwrap_or(default_port);

    Ok(ServerTarget {
        host,
        port,
        url: url.to_string(),
    })
}

// ── Internals ───────────────────────────────────────────────────────

struct Session {
    id: u64,
    target: ServerTarget,
    cancel: CancellationToken,
    /// Set only while a reconnect delay is pending.
    reconnect_timer: Option<CancellationToken>,
    outbound: mpsc::Sender<String>,
}

struct Inner {
    transport: Arc<dyn SignalingTransport>,
    config: SignalingConfig,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SignalingConnectionEvent>,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
}

enum LinkEnd {
    Cancelled,
    Lost(String),
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SignalingConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Apply a transition if `session_id` is still the current session.
    fn transition(
        &self,
        session_id: u64,
        state: ConnectionState,
        event: Option<SignalingConnectionEvent>,
    ) -> bool {
        let guard = self.lock_session();
        match guard.as_ref() {
            Some(session) if session.id == session_id => {
                self.state.send_replace(state);
                if let Some(event) = event {
                    self.emit(event);
                }
                true
            }
            _ => false,
        }
    }

    /// Tear down the current session, if any. Caller holds the lock.
    fn cancel_session(slot: &mut Option<Session>) -> bool {
        match slot.take() {
            Some(session) => {
                session.cancel.cancel();
                if let Some(timer) = session.reconnect_timer {
                    timer.cancel();
                }
                true
            }
            None => false,
        }
    }

    fn begin_session(
        &self,
        target: ServerTarget,
    ) -> (u64, CancellationToken, mpsc::Receiver<String>) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let mut guard = self.lock_session();
        Self::cancel_session(&mut guard);
        *guard = Some(Session {
            id,
            target,
            cancel: cancel.clone(),
            reconnect_timer: None,
            outbound,
        });
        self.state.send_replace(ConnectionState::Connecting);
        (id, cancel, outbound_rx)
    }

    /// Enter `Reconnecting(attempt)` and arm the pending timer.
    fn begin_reconnect_wait(
        &self,
        session_id: u64,
        attempt: u32,
        delay: Duration,
        timer: CancellationToken,
    ) -> bool {
        let mut guard = self.lock_session();
        match guard.as_mut() {
            Some(session) if session.id == session_id => {
                session.reconnect_timer = Some(timer);
                self.state
                    .send_replace(ConnectionState::Reconnecting { attempt });
                self.emit(SignalingConnectionEvent::Reconnecting {
                    attempt,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                });
                true
            }
            _ => false,
        }
    }

    fn clear_reconnect_timer(&self, session_id: u64) {
        let mut guard = self.lock_session();
        if let Some(session) = guard.as_mut().filter(|s| s.id == session_id) {
            session.reconnect_timer = None;
        }
    }

    fn handle_frame(&self, session_id: u64, text: String) {
        let event = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) if value.get("type").and_then(|t| t.as_str()) == Some("error") => {
                let message = value
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown server error")
                    .to_string();
                SignalingConnectionEvent::ServerError { message }
            }
            _ => SignalingConnectionEvent::Message { text },
        };

        let guard = self.lock_session();
        if guard.as_ref().is_some_and(|s| s.id == session_id) {
            self.emit(event);
        }
    }

    async fn dial(&self, url: &str) -> Result<SignalingSocket, TransportError> {
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, self.transport.connect(url)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectTimeout {
                url: url.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

// ── Session task ────────────────────────────────────────────────────

async fn run_session(
    inner: Arc<Inner>,
    session_id: u64,
    target: ServerTarget,
    cancel: CancellationToken,
    mut socket: SignalingSocket,
    mut outbound_rx: mpsc::Receiver<String>,
) {
    loop {
        let end = drive_link(&inner, session_id, &cancel, &mut socket, &mut outbound_rx).await;
        socket.sink.close().await;

        let reason = match end {
            LinkEnd::Cancelled => {
                tracing::debug!("signaling: session {session_id} closed");
                return;
            }
            LinkEnd::Lost(reason) => reason,
        };
        tracing::warn!("signaling: link to {} lost: {reason}", target.url);

        match reconnect(&inner, session_id, &target, &cancel).await {
            Some(fresh) => socket = fresh,
            None => return,
        }
    }
}

async fn drive_link(
    inner: &Inner,
    session_id: u64,
    cancel: &CancellationToken,
    socket: &mut SignalingSocket,
    outbound_rx: &mut mpsc::Receiver<String>,
) -> LinkEnd {
    let read_timeout = inner.config.read_timeout;
    let SignalingSocket { sink, stream } = socket;
    // Only inbound frames push the deadline; our own sends do not.
    let mut deadline = Instant::now() + read_timeout;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return LinkEnd::Cancelled,
            _ = tokio::time::sleep_until(deadline) => {
                return LinkEnd::Lost(format!(
                    "no frame within {} ms",
                    read_timeout.as_millis()
                ));
            }
            frame = recv_frame(stream) => match frame {
                None => return LinkEnd::Lost("socket closed".into()),
                Some(Err(e)) => return LinkEnd::Lost(e.to_string()),
                Some(Ok(text)) => {
                    deadline = Instant::now() + read_timeout;
                    inner.handle_frame(session_id, text);
                }
            },
            outbound = outbound_rx.recv() => match outbound {
                Some(text) => {
                    if let Err(e) = send_frame(sink, text).await {
                        return LinkEnd::Lost(e.to_string());
                    }
                }
                None => return LinkEnd::Cancelled,
            },
        }
    }
}

async fn recv_frame(stream: &mut Box<dyn FrameStream>) -> Option<Result<String, TransportError>> {
    stream.recv().await
}

async fn send_frame(sink: &mut Box<dyn FrameSink>, text: String) -> Result<(), TransportError> {
    sink.send(text).await
}

/// Bounded automatic reconnect. `None` when cancelled or exhausted.
async fn reconnect(
    inner: &Inner,
    session_id: u64,
    target: &ServerTarget,
    cancel: &CancellationToken,
) -> Option<SignalingSocket> {
    let max = inner.config.max_reconnect_attempts;

    for attempt in 1..=max {
        let delay = inner.config.reconnect_delay(attempt);
        let timer = CancellationToken::new();
        if !inner.begin_reconnect_wait(session_id, attempt, delay, timer.clone()) {
            return None;
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = timer.cancelled() => {
                tracing::info!("signaling: pending reconnect to {} cancelled", target.url);
                return None;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        inner.clear_reconnect_timer(session_id);

        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = inner.dial(&target.url) => result,
        };
        match result {
            Ok(mut socket) => {
                let connected = inner.transition(
                    session_id,
                    ConnectionState::Connected,
                    Some(SignalingConnectionEvent::Connected {
                        host: target.host.clone(),
                        port: target.port,
                    }),
                );
                if connected {
                    tracing::info!("signaling: reconnected to {} on attempt {attempt}", target.url);
                    return Some(socket);
                }
                socket.sink.close().await;
                return None;
            }
            Err(e) => {
                tracing::warn!("signaling: reconnect attempt {attempt}/{max} failed: {e}");
            }
        }
    }

    inner.transition(
        session_id,
        ConnectionState::Failed {
            reason: MAX_RECONNECT_REACHED.to_string(),
        },
        Some(SignalingConnectionEvent::MaxReconnectReached),
    );
    tracing::warn!("signaling: giving up on {} after {max} attempts", target.url);
    None
}

// ── SignalingConnection (public API) ────────────────────────────────

/// The signaling link. Transitions are driven internally; callers only
/// observe them through [`state`](Self::state), [`watch_state`](Self::watch_state)
/// and [`subscribe`](Self::subscribe).
pub struct SignalingConnection {
    inner: Arc<Inner>,
}

impl SignalingConnection {
    pub fn new(transport: Arc<dyn SignalingTransport>, config: SignalingConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state,
                events,
                session: Mutex::new(None),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    /// Link over WebSockets.
    pub fn websocket(config: SignalingConfig) -> Self {
        Self::new(Arc::new(WsTransport::new()), config)
    }

    /// Dial `host` (`host`, `host:port`, or a `ws://`/`wss://` url).
    ///
    /// Any existing session is torn down first. Resolves once the link is
    /// connected or the attempt failed; an initial failure does not retry.
    pub async fn connect_to_server(&self, host: &str) -> Result<(), TransportError> {
        let target = match resolve_target(host, self.inner.config.default_port) {
            Ok(target) => target,
            Err(e) => {
                let reason = e.to_string();
                {
                    let mut guard = self.inner.lock_session();
                    Inner::cancel_session(&mut guard);
                    self.inner.state.send_replace(ConnectionState::Failed {
                        reason: reason.clone(),
                    });
                }
                self.inner
                    .emit(SignalingConnectionEvent::ConnectionFailed { reason });
                return Err(e);
            }
        };

        let (session_id, cancel, outbound_rx) = self.inner.begin_session(target.clone());
        tracing::info!("signaling: connecting to {}", target.url);

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.inner.dial(&target.url) => result,
        };

        match result {
            Ok(mut socket) => {
                let connected = self.inner.transition(
                    session_id,
                    ConnectionState::Connected,
                    Some(SignalingConnectionEvent::Connected {
                        host: target.host.clone(),
                        port: target.port,
                    }),
                );
                if !connected {
                    socket.sink.close().await;
                    return Err(TransportError::Cancelled);
                }
                tracing::info!("signaling: connected to {}", target.url);
                tokio::spawn(run_session(
                    self.inner.clone(),
                    session_id,
                    target,
                    cancel,
                    socket,
                    outbound_rx,
                ));
                Ok(())
            }
            Err(TransportError::Cancelled) => Err(TransportError::Cancelled),
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!("signaling: connect to {} failed: {reason}", target.url);
                self.inner.transition(
                    session_id,
                    ConnectionState::Failed {
                        reason: reason.clone(),
                    },
                    Some(SignalingConnectionEvent::ConnectionFailed { reason }),
                );
                Err(e)
            }
        }
    }

    /// Close the link and stop any reconnecting. Always ends in `Disconnected`.
    pub fn disconnect(&self) {
        let had_session = {
            let mut guard = self.inner.lock_session();
            let had_session = Inner::cancel_session(&mut guard);
            let previous = self.inner.state.send_replace(ConnectionState::Disconnected);
            had_session || previous != ConnectionState::Disconnected
        };
        if had_session {
            tracing::info!("signaling: disconnected");
            self.inner.emit(SignalingConnectionEvent::Disconnected);
        }
    }

    /// Stop a pending automatic reconnect. The current state is left as is.
    ///
    /// Returns `false` if no reconnect delay was pending.
    pub fn cancel_reconnect(&self) -> bool {
        let mut guard = self.inner.lock_session();
        match guard.as_mut().and_then(|s| s.reconnect_timer.take()) {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }

    /// Enter `Listening`. Only allowed while idle (Disconnected or Failed).
    pub fn listen(&self) -> bool {
        let mut guard = self.inner.lock_session();
        let idle = matches!(
            *self.inner.state.borrow(),
            ConnectionState::Disconnected
                | ConnectionState::Failed { .. }
                | ConnectionState::Listening
        );
        if !idle {
            return false;
        }
        Inner::cancel_session(&mut guard);
        self.inner.state.send_replace(ConnectionState::Listening);
        true
    }

    /// Queue a text frame on the connected link.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        let outbound = {
            let guard = self.inner.lock_session();
            match guard.as_ref() {
                Some(session) if *self.inner.state.borrow() == ConnectionState::Connected => {
                    session.outbound.clone()
                }
                _ => return Err(TransportError::NotConnected),
            }
        };
        outbound
            .send(text.into())
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    /// Serialize `message` as JSON and send it.
    pub async fn send_json<T: serde::Serialize>(&self, message: &T) -> Result<(), TransportError> {
        let text = serde_json::to_string(message)?;
        self.send(text).await
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Observe state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to link events.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Target of the current session.
    pub fn target(&self) -> Option<ServerTarget> {
        self.inner.lock_session().as_ref().map(|s| s.target.clone())
    }
}

impl Drop for SignalingConnection {
    fn drop(&mut self) {
        let mut guard = self.inner.lock_session();
        Inner::cancel_session(&mut guard);
    }
}
