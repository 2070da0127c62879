//! The self-healing duplex socket.
//!
//! [`Transport::connect`] spawns one task that owns the WebSocket for its
//! whole lifetime: connect, send the token handshake, interpret the first
//! inbound frame as the authentication status, then pump classified frames
//! to the coordinator. Non-terminal closures re-enter connecting after the
//! current backoff delay; the [`CloseReason`] set never reconnects.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::ClientRequestBuilder;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use lattice_core::backoff::{BackoffSchedule, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_DELAY_MS};

use crate::frame::{classify, ServerFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Terminal closure reasons. Any other closure reconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    AuthenticationError,
    ProtocolError,
    NoSubscribers,
    ManualDisconnect,
}

impl CloseReason {
    /// Wire-format name of the reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticationError => "authentication-error",
            Self::ProtocolError => "protocol-error",
            Self::NoSubscribers => "no-subscribers",
            Self::ManualDisconnect => "manual-disconnect",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events the transport reports to its owner.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// Handshake completed with status 200.
    Connected,
    /// A classified post-handshake frame.
    Frame(ServerFrame),
    /// The server rejected the token; terminal.
    AuthFailed(String),
    /// The socket closed. `terminal` carries the stashed reason when no
    /// reconnection will follow.
    Disconnected {
        at_ms: i64,
        terminal: Option<CloseReason>,
    },
}

/// Transport construction inputs.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Fully rendered WebSocket URL.
    pub url: String,
    /// Authentication token sent in the handshake frame.
    pub token: String,
    /// Optional WebSocket sub-protocols.
    pub protocols: Vec<String>,
    /// First reconnect delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Reconnect delay cap in milliseconds.
    pub max_backoff_ms: u64,
}

impl TransportConfig {
    /// Config with default backoff bounds.
    #[must_use]
    pub fn new(url: &str, token: &str) -> Self {
        Self {
            url: url.to_owned(),
            token: token.to_owned(),
            protocols: Vec::new(),
            initial_backoff_ms: DEFAULT_INITIAL_DELAY_MS,
            max_backoff_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

enum Command {
    Send(String),
    Disconnect(CloseReason),
}

/// Handle to the socket task.
pub struct Transport {
    cmd_tx: mpsc::Sender<Command>,
    ready: Arc<AtomicBool>,
    _task: JoinHandle<()>,
}

impl Transport {
    /// Spawn the socket task. Events arrive on the returned receiver; the
    /// channel closes when the transport reaches a terminal state.
    #[must_use]
    pub fn connect(config: TransportConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let ready = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run(config, cmd_rx, event_tx, Arc::clone(&ready)));
        (
            Self {
                cmd_tx,
                ready,
                _task: task,
            },
            event_rx,
        )
    }

    /// Whether the handshake has completed on the current socket.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Send a text frame if the socket is ready; otherwise log and drop.
    /// There is no outbound queueing across reconnects.
    pub fn send(&self, text: String) -> bool {
        if !self.is_ready() {
            warn!(len = text.len(), "socket not ready, dropping outbound frame");
            return false;
        }
        if self.cmd_tx.try_send(Command::Send(text)).is_err() {
            warn!("command queue unavailable, dropping outbound frame");
            return false;
        }
        true
    }

    /// Close terminally with the given reason. Cancels a pending reconnect
    /// timer if one is running.
    pub fn disconnect(&self, reason: CloseReason) {
        let _ = self.cmd_tx.try_send(Command::Disconnect(reason));
    }
}

/// How one socket session ended.
enum SessionEnd {
    /// Non-terminal closure; reconnect after backoff.
    Retry,
    /// Terminal closure with the stashed reason.
    Closed(CloseReason),
    /// The handle or the event consumer is gone; stop silently.
    Abandoned,
}

async fn run(
    config: TransportConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<TransportEvent>,
    ready: Arc<AtomicBool>,
) {
    let Ok(uri) = config.url.parse::<Uri>() else {
        warn!(url = %config.url, "invalid endpoint URL");
        let _ = event_tx
            .send(TransportEvent::Disconnected {
                at_ms: now_ms(),
                terminal: Some(CloseReason::ProtocolError),
            })
            .await;
        return;
    };

    let mut backoff = BackoffSchedule::new(config.initial_backoff_ms, config.max_backoff_ms);

    loop {
        let mut request = ClientRequestBuilder::new(uri.clone());
        for protocol in &config.protocols {
            request = request.with_sub_protocol(protocol.clone());
        }

        let ws = match connect_async(request).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                debug!(error = %e, "connect failed");
                let disconnected = TransportEvent::Disconnected {
                    at_ms: now_ms(),
                    terminal: None,
                };
                if event_tx.send(disconnected).await.is_err() {
                    return;
                }
                if !wait_backoff(backoff.next_delay(), &mut cmd_rx, &event_tx).await {
                    return;
                }
                continue;
            }
        };
        backoff.reset();

        let end = session(ws, &config.token, &mut cmd_rx, &event_tx, &ready).await;
        ready.store(false, Ordering::Relaxed);

        match end {
            SessionEnd::Retry => {
                let disconnected = TransportEvent::Disconnected {
                    at_ms: now_ms(),
                    terminal: None,
                };
                if event_tx.send(disconnected).await.is_err() {
                    return;
                }
                if !wait_backoff(backoff.next_delay(), &mut cmd_rx, &event_tx).await {
                    return;
                }
            }
            SessionEnd::Closed(reason) => {
                info!(%reason, "transport closed");
                let _ = event_tx
                    .send(TransportEvent::Disconnected {
                        at_ms: now_ms(),
                        terminal: Some(reason),
                    })
                    .await;
                return;
            }
            SessionEnd::Abandoned => return,
        }
    }
}

/// Drive one socket from handshake to closure.
async fn session(
    ws: WsStream,
    token: &str,
    cmd_rx: &mut mpsc::Receiver<Command>,
    event_tx: &mpsc::Sender<TransportEvent>,
    ready: &AtomicBool,
) -> SessionEnd {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let hello = serde_json::json!({ "token": token }).to_string();
    if ws_tx.send(Message::text(hello)).await.is_err() {
        return SessionEnd::Retry;
    }

    let mut authenticated = false;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(text)) => {
                    if ws_tx.send(Message::text(text)).await.is_err() {
                        return SessionEnd::Retry;
                    }
                }
                Some(Command::Disconnect(reason)) => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return SessionEnd::Closed(reason);
                }
                None => return SessionEnd::Abandoned,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let value: Option<Value> = serde_json::from_str(text.as_str()).ok();
                    if authenticated {
                        match value.and_then(classify) {
                            Some(ServerFrame::Maintenance(_)) => {
                                info!("maintenance rollover, reconnecting");
                                return SessionEnd::Retry;
                            }
                            Some(frame) => {
                                if event_tx.send(TransportEvent::Frame(frame)).await.is_err() {
                                    return SessionEnd::Abandoned;
                                }
                            }
                            None => warn!("unclassifiable frame, dropping"),
                        }
                        continue;
                    }
                    // First inbound frame is the authentication status.
                    match value.and_then(classify) {
                        Some(ServerFrame::Status { status_code: _, error: Some(error) }) => {
                            warn!(%error, "authentication rejected");
                            if event_tx.send(TransportEvent::AuthFailed(error)).await.is_err() {
                                return SessionEnd::Abandoned;
                            }
                            return SessionEnd::Closed(CloseReason::AuthenticationError);
                        }
                        Some(ServerFrame::Status { status_code: 200, error: None }) => {
                            authenticated = true;
                            ready.store(true, Ordering::Relaxed);
                            if event_tx.send(TransportEvent::Connected).await.is_err() {
                                return SessionEnd::Abandoned;
                            }
                        }
                        _ => {
                            warn!("first frame was not an authentication status");
                            return SessionEnd::Retry;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Retry,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "socket error");
                    return SessionEnd::Retry;
                }
            }
        }
    }
}

/// Wait out the backoff delay. A disconnect command cancels the pending
/// reconnect and ends the transport. Returns `false` when the run loop
/// should stop.
async fn wait_backoff(
    delay: std::time::Duration,
    cmd_rx: &mut mpsc::Receiver<Command>,
    event_tx: &mpsc::Sender<TransportEvent>,
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => return true,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(text)) => {
                    warn!(len = text.len(), "socket closed, dropping outbound frame");
                }
                Some(Command::Disconnect(reason)) => {
                    info!(%reason, "reconnect cancelled");
                    let _ = event_tx
                        .send(TransportEvent::Disconnected {
                            at_ms: now_ms(),
                            terminal: Some(reason),
                        })
                        .await;
                    return false;
                }
                None => return false,
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
