//! In-memory stand-ins for the peer backend, the relay and the view. They
//! record what the orchestrator asks of them so tests can assert on it.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{MeshError, MeshResult};
use crate::media::{MediaBundle, MediaStream, MeshView, Notice, RemoteTrack, TrackKind};
use crate::peer::{LinkEventKind, LinkEvents, LinkState, PeerConnector, PeerLink};
use crate::signaling::{
    IceCandidate, OutboundSignal, ParticipantId, SessionDescription, SignalKind, SignalPayload,
    SignalSink,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

/// Calls that can be made to fail on a mock link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkCall {
    Connect,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
}

#[derive(Debug, Clone, Default)]
pub struct OpLog(Arc<Mutex<Vec<LinkOp>>>);

impl OpLog {
    fn push(&self, op: LinkOp) {
        self.0.lock().push(op);
    }

    pub fn snapshot(&self) -> Vec<LinkOp> {
        self.0.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&LinkOp) -> bool) -> usize {
        self.0.lock().iter().filter(|op| pred(op)).count()
    }
}

type FailureSet = Arc<Mutex<HashSet<LinkCall>>>;

pub struct MockLink {
    label: String,
    ops: OpLog,
    failing: FailureSet,
    closed: Arc<AtomicBool>,
}

impl MockLink {
    /// A link that belongs to no connector.
    pub fn detached() -> Self {
        Self::with_label("detached")
    }

    fn with_label(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ops: OpLog::default(),
            failing: FailureSet::default(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn ops(&self) -> OpLog {
        self.ops.clone()
    }

    pub fn fail_on(&self, call: LinkCall) {
        self.failing.lock().insert(call);
    }

    fn check(&self, call: LinkCall) -> MeshResult<()> {
        if self.failing.lock().contains(&call) {
            return Err(MeshError::Rtc(format!("{call:?} failed on {}", self.label)));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self) -> MeshResult<SessionDescription> {
        self.check(LinkCall::CreateOffer)?;
        self.ops.push(LinkOp::CreateOffer);
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.label)))
    }

    async fn create_answer(&self) -> MeshResult<SessionDescription> {
        self.check(LinkCall::CreateAnswer)?;
        self.ops.push(LinkOp::CreateAnswer);
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.label)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> MeshResult<()> {
        self.check(LinkCall::SetLocalDescription)?;
        self.ops.push(LinkOp::SetLocal(description));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> MeshResult<()> {
        self.check(LinkCall::SetRemoteDescription)?;
        self.ops.push(LinkOp::SetRemote(description));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MeshResult<()> {
        self.check(LinkCall::AddIceCandidate)?;
        self.ops.push(LinkOp::AddCandidate(candidate));
        Ok(())
    }

    async fn close(&self) -> MeshResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.ops.push(LinkOp::Close);
        }
        Ok(())
    }
}

/// Test-side view of a link handed out by [`MockConnector`]. Lets a test play
/// the native connection: emit candidates, tracks and state changes.
#[derive(Debug, Clone)]
pub struct MockLinkHandle {
    events: LinkEvents,
    ops: OpLog,
    closed: Arc<AtomicBool>,
    tracks_attached: usize,
}

impl MockLinkHandle {
    pub fn participant(&self) -> &ParticipantId {
        self.events.participant()
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn ops(&self) -> OpLog {
        self.ops.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn tracks_attached(&self) -> usize {
        self.tracks_attached
    }

    pub fn emit_candidate(&self, candidate: IceCandidate) {
        self.events.emit(LinkEventKind::LocalCandidate(candidate));
    }

    pub fn emit_state(&self, state: LinkState) {
        self.events.emit(LinkEventKind::StateChanged(state));
    }

    pub fn emit_track(&self, track: Arc<dyn RemoteTrack>) {
        self.events.emit(LinkEventKind::RemoteTrack(track));
    }
}

#[derive(Default)]
pub struct MockConnector {
    links: Mutex<Vec<MockLinkHandle>>,
    failing: Mutex<HashMap<ParticipantId, HashSet<LinkCall>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every link created for `participant` from now on fails `call`.
    pub fn fail_on(&self, participant: impl Into<ParticipantId>, call: LinkCall) {
        self.failing
            .lock()
            .entry(participant.into())
            .or_default()
            .insert(call);
    }

    pub fn clear_failures(&self, participant: &ParticipantId) {
        self.failing.lock().remove(participant);
    }

    pub fn links(&self) -> Vec<MockLinkHandle> {
        self.links.lock().clone()
    }

    pub fn links_for(&self, participant: &ParticipantId) -> Vec<MockLinkHandle> {
        self.links
            .lock()
            .iter()
            .filter(|link| link.participant() == participant)
            .cloned()
            .collect()
    }

    pub fn latest(&self, participant: &ParticipantId) -> Option<MockLinkHandle> {
        self.links_for(participant).pop()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        media: &MediaBundle,
        events: LinkEvents,
    ) -> MeshResult<Box<dyn PeerLink>> {
        let failing: HashSet<LinkCall> = self
            .failing
            .lock()
            .get(events.participant())
            .cloned()
            .unwrap_or_default();
        if failing.contains(&LinkCall::Connect) {
            return Err(MeshError::Rtc(format!(
                "refusing link to {}",
                events.participant()
            )));
        }

        let mut link = MockLink::with_label(format!(
            "{}#{}",
            events.participant(),
            events.generation()
        ));
        link.failing = Arc::new(Mutex::new(failing));
        self.links.lock().push(MockLinkHandle {
            ops: link.ops(),
            closed: Arc::clone(&link.closed),
            tracks_attached: media.len(),
            events,
        });
        Ok(Box::new(link))
    }
}

/// Captures outbound signals instead of putting them on a socket.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<OutboundSignal>>,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<OutboundSignal> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn count(&self, kind: SignalKind, to: &ParticipantId) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|signal| signal.payload.kind() == kind && &signal.to == to)
            .count()
    }

    pub fn last_description(&self, kind: SignalKind, to: &ParticipantId) -> Option<SessionDescription> {
        self.sent
            .lock()
            .iter()
            .rev()
            .filter(|signal| &signal.to == to)
            .find_map(|signal| match (&signal.payload, kind) {
                (SignalPayload::Offer(desc), SignalKind::Offer)
                | (SignalPayload::Answer(desc), SignalKind::Answer) => Some(desc.clone()),
                _ => None,
            })
    }

    /// Later sends fail with `ChannelClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl SignalSink for RecordingSink {
    fn send_signal(&self, signal: OutboundSignal) -> MeshResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::ChannelClosed);
        }
        self.sent.lock().push(signal);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    Attached {
        participant: ParticipantId,
        stream_id: String,
        tracks: usize,
    },
    Detached(ParticipantId),
    Notice(Notice),
}

/// Keeps the "grid" in memory alongside a log of every call.
#[derive(Debug, Default)]
pub struct RecordingView {
    events: Mutex<Vec<ViewEvent>>,
    streams: Mutex<HashMap<ParticipantId, MediaStream>>,
}

impl RecordingView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ViewEvent> {
        self.events.lock().clone()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ViewEvent::Notice(notice) => Some(notice.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn stream(&self, participant: &ParticipantId) -> Option<MediaStream> {
        self.streams.lock().get(participant).cloned()
    }

    pub fn visible(&self) -> usize {
        self.streams.lock().len()
    }
}

impl MeshView for RecordingView {
    fn attach_stream(&self, participant: &ParticipantId, stream: MediaStream) {
        self.events.lock().push(ViewEvent::Attached {
            participant: participant.clone(),
            stream_id: stream.id().to_string(),
            tracks: stream.tracks().len(),
        });
        self.streams.lock().insert(participant.clone(), stream);
    }

    fn detach_stream(&self, participant: &ParticipantId) {
        self.events
            .lock()
            .push(ViewEvent::Detached(participant.clone()));
        self.streams.lock().remove(participant);
    }

    fn notify(&self, notice: Notice) {
        self.events.lock().push(ViewEvent::Notice(notice));
    }
}

#[derive(Debug, Clone)]
pub struct MockRemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

impl MockRemoteTrack {
    pub fn shared(id: &str, stream_id: &str, kind: TrackKind) -> Arc<dyn RemoteTrack> {
        Arc::new(Self {
            id: id.to_string(),
            stream_id: stream_id.to_string(),
            kind,
        })
    }
}

impl RemoteTrack for MockRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
