//! The native peer connection behind a negotiation, seen through two traits:
//! [`PeerConnector`] builds one link per remote participant and
//! [`PeerLink`] runs the offer/answer and candidate calls on it.

pub mod rtc;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::MeshResult;
use crate::media::{MediaBundle, RemoteTrack};
use crate::signaling::{IceCandidate, ParticipantId, SessionDescription};

pub use rtc::{RtcConnector, RtcPeerLink, RtcRemoteTrack};

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> MeshResult<SessionDescription>;
    async fn create_answer(&self) -> MeshResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> MeshResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> MeshResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MeshResult<()>;
    /// Releases the connection. Safe to call more than once.
    async fn close(&self) -> MeshResult<()>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Build a link, attach every track of `media`, and install callbacks that
    /// report through `events` before returning.
    async fn connect(&self, media: &MediaBundle, events: LinkEvents)
    -> MeshResult<Box<dyn PeerLink>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// `Disconnected` can recover on its own; only these two cannot.
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    LocalCandidate(IceCandidate),
    RemoteTrack(Arc<dyn RemoteTrack>),
    StateChanged(LinkState),
}

#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub participant: ParticipantId,
    pub generation: u64,
    pub kind: LinkEventKind,
}

/// Callback-side handle: tags everything a link reports with the participant
/// and generation it belongs to and queues it for the orchestrator.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    participant: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEvents {
    pub fn new(
        participant: ParticipantId,
        generation: u64,
        tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            participant,
            generation,
            tx,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, kind: LinkEventKind) {
        let event = LinkEvent {
            participant: self.participant.clone(),
            generation: self.generation,
            kind,
        };
        if self.tx.send(event).is_err() {
            tracing::trace!(
                participant = %self.participant,
                generation = self.generation,
                "session gone; dropping link event"
            );
        }
    }
}
