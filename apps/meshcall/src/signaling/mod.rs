pub mod wire;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use crate::error::{MeshError, MeshResult};

pub use wire::{
    ClientMessage, IceCandidate, InboundEvent, OutboundSignal, ParticipantId, SdpType,
    ServerMessage, SessionDescription, SignalEnvelope, SignalKind, SignalPayload,
};

const LOG_TARGET: &str = "meshcall::signaling";
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Outbound half of the relay as the orchestrator sees it.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, signal: OutboundSignal) -> MeshResult<()>;
}

/// Opaque session token handed out by the authentication service.
#[derive(Clone)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub heartbeat_interval: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT,
        }
    }
}

/// WebSocket connection to the room relay.
///
/// Inbound frames are validated into [`InboundEvent`]s on the receiver
/// returned by [`SignalingClient::connect`]; the stream always ends with a
/// single [`InboundEvent::Disconnected`]. There is no reconnect.
pub struct SignalingClient {
    room: String,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    events_tx: mpsc::UnboundedSender<InboundEvent>,
    disconnected: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    pub async fn connect(
        base_url: &str,
        room: &str,
        credentials: &Credentials,
        config: &SignalingConfig,
    ) -> MeshResult<(Arc<Self>, mpsc::UnboundedReceiver<InboundEvent>)> {
        let websocket_url = signaling_url(base_url, room, credentials)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| MeshError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target: LOG_TARGET,
            host = websocket_url.host_str().unwrap_or_default(),
            room,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<InboundEvent>();
        let disconnected = Arc::new(AtomicBool::new(false));

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target: LOG_TARGET, error = %err, "dropping unencodable message");
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_events = events_tx.clone();
        let reader_disconnected = Arc::clone(&disconnected);
        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(target: LOG_TARGET, kind = "text", len = text.len(), "ws in");
                        forward_frame(&text, &reader_events);
                    }
                    Ok(Message::Binary(data)) => {
                        tracing::trace!(target: LOG_TARGET, kind = "binary", len = data.len(), "ws in");
                        match String::from_utf8(data) {
                            Ok(text) => forward_frame(&text, &reader_events),
                            Err(_) => {
                                tracing::warn!(target: LOG_TARGET, "dropping non utf-8 binary frame");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target: LOG_TARGET, "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target: LOG_TARGET, "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                }
            }
            emit_disconnected(&reader_disconnected, &reader_events);
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat_interval = config.heartbeat_interval;
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let client = Arc::new(SignalingClient {
            room: room.to_string(),
            send_tx,
            events_tx,
            disconnected,
            tasks: Mutex::new(vec![writer_handle, reader_handle, heartbeat_handle]),
        });
        Ok((client, events_rx))
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn send(&self, signal: OutboundSignal) -> MeshResult<()> {
        let to = signal.to.clone();
        let kind = signal.payload.kind();
        let message = signal.into_client_message()?;
        self.send_tx
            .send(message)
            .map_err(|_| MeshError::ChannelClosed)?;
        tracing::trace!(target: LOG_TARGET, to = %to, kind = kind.as_str(), "queued signal");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst) || self.send_tx.is_closed()
    }

    /// Stop all relay tasks. Emits `Disconnected` if the socket had not
    /// already reported it.
    pub fn close(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        emit_disconnected(&self.disconnected, &self.events_tx);
        tracing::debug!(target: LOG_TARGET, room = %self.room, "signaling client closed");
    }
}

impl SignalSink for SignalingClient {
    fn send_signal(&self, signal: OutboundSignal) -> MeshResult<()> {
        self.send(signal)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

fn forward_frame(text: &str, events: &mpsc::UnboundedSender<InboundEvent>) {
    let event = match ServerMessage::parse(text).and_then(ServerMessage::into_event) {
        Ok(Some(event)) => event,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(target: LOG_TARGET, error = %err, "dropping relay frame");
            return;
        }
    };
    if events.send(event).is_err() {
        tracing::debug!(target: LOG_TARGET, "event receiver dropped; discarding relay frame");
    }
}

fn emit_disconnected(flag: &AtomicBool, events: &mpsc::UnboundedSender<InboundEvent>) {
    if !flag.swap(true, Ordering::SeqCst) {
        let _ = events.send(InboundEvent::Disconnected);
    }
}

/// `http://host/base` → `ws://host/base/ws/signaling/{room}?token=...`
pub fn signaling_url(base: &str, room: &str, credentials: &Credentials) -> MeshResult<Url> {
    if room.trim().is_empty() {
        return Err(MeshError::Setup("room id must not be empty".into()));
    }
    let mut url = Url::parse(base)
        .map_err(|err| MeshError::Setup(format!("invalid signaling base {base}: {err}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(MeshError::Setup(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| MeshError::Setup("invalid websocket scheme".into()))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| MeshError::Setup("cannot mutate signaling url path".into()))?;
        segments.pop_if_empty();
        segments.push("ws");
        segments.push("signaling");
        segments.push(room);
    }
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("token", credentials.as_str());
    url.set_fragment(None);
    Ok(url)
}
