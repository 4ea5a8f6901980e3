/// Socket abstraction for signaling traffic.
///
/// In production: `WsTransport` (WebSocket via tokio-tungstenite).
/// In tests: `mock::MockTransport` (tokio channels, scripted failures).
///
/// A connected socket is handed out as two halves so a reader loop can
/// wait on inbound frames while outbound frames are written concurrently.
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::TransportError;

/// Write half of a signaling socket.
#[async_trait::async_trait]
pub trait FrameSink: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the socket. Errors are ignored; the peer may already be gone.
    async fn close(&mut self);
}

/// Read half of a signaling socket.
#[async_trait::async_trait]
pub trait FrameStream: Send {
    /// Next text frame. `None` once the socket is closed.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
}

/// A connected signaling socket.
pub struct SignalingSocket {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl SignalingSocket {
    pub fn new(sink: Box<dyn FrameSink>, stream: Box<dyn FrameStream>) -> Self {
        Self { sink, stream }
    }
}

/// Dials signaling servers.
#[async_trait::async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open a socket to `url`. Timeouts are applied by the caller.
    async fn connect(&self, url: &str) -> Result<SignalingSocket, TransportError>;
}

// ── WebSocket implementation ────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production transport: one WebSocket per signaling socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl SignalingTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<SignalingSocket, TransportError> {
        let (ws_stream, _) = connect_async(url).await.map_err(|e| TransportError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        tracing::debug!("ws: connected to {url}");

        let (write, read) = ws_stream.split();
        Ok(SignalingSocket::new(
            Box::new(WsSink(write)),
            Box::new(WsReader(read)),
        ))
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait::async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.0.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

struct WsReader(SplitStream<WsStream>);

#[async_trait::async_trait]
impl FrameStream for WsReader {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        while let Some(msg) = self.0.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        tracing::debug!("ws: dropping non-utf8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }
}

// ── MockTransport (tests) ───────────────────────────────────────────

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! In-memory transport. Each successful `connect` hands the test a
    //! [`MockPeer`] holding the server side of the socket.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use super::*;

    /// The server side of one mock socket.
    pub struct MockPeer {
        pub url: String,
        /// Frames the client sent.
        pub from_client: mpsc::UnboundedReceiver<String>,
        /// Push frames to the client. Drop it to close the socket.
        pub to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    }

    #[derive(Default)]
    struct Script {
        /// Outcome of upcoming connects; `true` = fail. Empty = succeed.
        failures: VecDeque<bool>,
        fail_all: bool,
        attempts: Vec<String>,
    }

    /// Transport whose connects are scripted by the test.
    #[derive(Clone)]
    pub struct MockTransport {
        script: Arc<Mutex<Script>>,
        peers: mpsc::UnboundedSender<MockPeer>,
    }

    impl MockTransport {
        /// Returns the transport and a receiver yielding one `MockPeer`
        /// per successful connect.
        pub fn new() -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
            let (peers, rx) = mpsc::unbounded_channel();
            (
                Self {
                    script: Arc::new(Mutex::new(Script::default())),
                    peers,
                },
                rx,
            )
        }

        /// Queue the outcome of the next connects, in order.
        pub fn push_outcomes(&self, fail: &[bool]) {
            self.script.lock().unwrap().failures.extend(fail.iter().copied());
        }

        /// Fail every connect until turned off again.
        pub fn set_fail_all(&self, fail: bool) {
            self.script.lock().unwrap().fail_all = fail;
        }

        /// Urls of every connect attempt so far.
        pub fn attempts(&self) -> Vec<String> {
            self.script.lock().unwrap().attempts.clone()
        }
    }

    struct MockSink(mpsc::UnboundedSender<String>);

    #[async_trait::async_trait]
    impl FrameSink for MockSink {
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            self.0
                .send(text)
                .map_err(|_| TransportError::Send("mock peer gone".into()))
        }

        async fn close(&mut self) {}
    }

    struct MockStream(mpsc::UnboundedReceiver<Result<String, TransportError>>);

    #[async_trait::async_trait]
    impl FrameStream for MockStream {
        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            self.0.recv().await
        }
    }

    #[async_trait::async_trait]
    impl SignalingTransport for MockTransport {
        async fn connect(&self, url: &str) -> Result<SignalingSocket, TransportError> {
            let fail = {
                let mut script = self.script.lock().unwrap();
                script.attempts.push(url.to_string());
                let queued = script.failures.pop_front().unwrap_or(false);
                script.fail_all || queued
            };
            if fail {
                return Err(TransportError::Connect {
                    url: url.to_string(),
                    reason: "mock: connection refused".into(),
                });
            }

            let (client_tx, from_client) = mpsc::unbounded_channel();
            let (to_client, client_rx) = mpsc::unbounded_channel();
            let _ = self.peers.send(MockPeer {
                url: url.to_string(),
                from_client,
                to_client,
            });
            Ok(SignalingSocket::new(
                Box::new(MockSink(client_tx)),
                Box::new(MockStream(client_rx)),
            ))
        }
    }
}
