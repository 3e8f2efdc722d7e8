use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{MeshError, MeshResult};
use crate::media::{MediaStream, RemoteTrack};
use crate::peer::PeerLink;
use crate::signaling::{IceCandidate, ParticipantId, SessionDescription};

const LOG_TARGET: &str = "meshcall::negotiation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Unassigned,
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationPhase {
    Unassigned,
    /// Offer being created and applied locally.
    OfferPending,
    /// Offer on the wire, waiting for the answer.
    OfferSent,
    /// Answer received and being applied.
    AnswerPending,
    /// Offer received and being applied; answer being created.
    AnsweringOffer,
    /// Answer on the wire.
    AnswerSent,
    Stable,
    Closed,
}

impl NegotiationPhase {
    pub fn can_transition_to(self, next: NegotiationPhase) -> bool {
        use NegotiationPhase::*;
        match (self, next) {
            (_, Closed) => true,
            (Unassigned, OfferPending | AnsweringOffer) => true,
            (OfferPending, OfferSent) => true,
            (OfferSent, AnswerPending) => true,
            (AnswerPending, Stable) => true,
            (AnsweringOffer, AnswerSent) => true,
            (AnswerSent, Stable) => true,
            _ => false,
        }
    }

    /// Phases in which the negotiation is waiting on a step that must finish
    /// within the session's negotiation timeout.
    pub fn is_in_flight(self) -> bool {
        !matches!(
            self,
            NegotiationPhase::Unassigned | NegotiationPhase::Stable | NegotiationPhase::Closed
        )
    }
}

/// Offer/answer progress for the connection to one remote participant.
///
/// Owns the [`PeerLink`]. Remote candidates that arrive before the remote
/// description are queued and applied in arrival order as soon as it is set.
pub struct NegotiationState {
    participant: ParticipantId,
    generation: u64,
    link: Box<dyn PeerLink>,
    role: Role,
    phase: NegotiationPhase,
    local_description_set: bool,
    remote_description_set: bool,
    remote_description: Option<SessionDescription>,
    pending_remote_candidates: VecDeque<IceCandidate>,
    media_tracks_attached: bool,
    phase_started: Instant,
    remote_stream: Option<MediaStream>,
}

impl fmt::Debug for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationState")
            .field("participant", &self.participant)
            .field("generation", &self.generation)
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("local_description_set", &self.local_description_set)
            .field("remote_description_set", &self.remote_description_set)
            .field("pending_remote_candidates", &self.pending_remote_candidates.len())
            .field("media_tracks_attached", &self.media_tracks_attached)
            .finish()
    }
}

impl NegotiationState {
    pub fn new(
        participant: ParticipantId,
        generation: u64,
        link: Box<dyn PeerLink>,
        media_tracks_attached: bool,
    ) -> Self {
        Self {
            participant,
            generation,
            link,
            role: Role::Unassigned,
            phase: NegotiationPhase::Unassigned,
            local_description_set: false,
            remote_description_set: false,
            remote_description: None,
            pending_remote_candidates: VecDeque::new(),
            media_tracks_attached,
            phase_started: Instant::now(),
            remote_stream: None,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn local_description_set(&self) -> bool {
        self.local_description_set
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// The offer or answer applied as remote description, if any.
    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn media_tracks_attached(&self) -> bool {
        self.media_tracks_attached
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    /// Sets the role once. Returns false if a role was already assigned.
    pub fn assign_role(&mut self, role: Role) -> bool {
        if self.role != Role::Unassigned || role == Role::Unassigned {
            return false;
        }
        self.role = role;
        tracing::debug!(
            target: LOG_TARGET,
            participant = %self.participant,
            generation = self.generation,
            ?role,
            "role assigned"
        );
        true
    }

    fn transition(&mut self, next: NegotiationPhase) -> MeshResult<()> {
        if !self.phase.can_transition_to(next) {
            tracing::warn!(
                target: LOG_TARGET,
                participant = %self.participant,
                from = ?self.phase,
                to = ?next,
                "rejected negotiation transition"
            );
            return Err(MeshError::conflict(
                &self.participant,
                format!("invalid transition {:?} -> {:?}", self.phase, next),
            ));
        }
        tracing::trace!(
            target: LOG_TARGET,
            participant = %self.participant,
            from = ?self.phase,
            to = ?next,
            "negotiation transition"
        );
        self.phase = next;
        self.phase_started = Instant::now();
        Ok(())
    }

    /// Creates the offer and applies it locally. The caller sends it and then
    /// calls [`mark_offer_sent`](Self::mark_offer_sent).
    pub async fn start_offer(&mut self) -> MeshResult<SessionDescription> {
        if self.role != Role::Initiator {
            return Err(MeshError::conflict(
                &self.participant,
                format!("cannot offer as {:?}", self.role),
            ));
        }
        self.transition(NegotiationPhase::OfferPending)?;
        let offer = self.link.create_offer().await?;
        self.link.set_local_description(offer.clone()).await?;
        self.local_description_set = true;
        Ok(offer)
    }

    pub fn mark_offer_sent(&mut self) -> MeshResult<()> {
        self.transition(NegotiationPhase::OfferSent)
    }

    /// Applies a remote offer and produces the answer to send back. An
    /// unassigned entry becomes the responder.
    pub async fn accept_offer(&mut self, offer: SessionDescription) -> MeshResult<SessionDescription> {
        if self.remote_description_set {
            return Err(MeshError::conflict(
                &self.participant,
                "offer after remote description was set",
            ));
        }
        if self.role == Role::Initiator {
            return Err(MeshError::conflict(
                &self.participant,
                "offer from a responder while our own offer is outstanding",
            ));
        }
        self.assign_role(Role::Responder);
        self.transition(NegotiationPhase::AnsweringOffer)?;

        self.link.set_remote_description(offer.clone()).await?;
        self.remote_description_set = true;
        self.remote_description = Some(offer);
        self.flush_pending_candidates().await;

        let answer = self.link.create_answer().await?;
        self.link.set_local_description(answer.clone()).await?;
        self.local_description_set = true;
        Ok(answer)
    }

    /// Called once the answer has been handed to the relay.
    pub fn mark_answer_sent(&mut self) -> MeshResult<()> {
        self.transition(NegotiationPhase::AnswerSent)?;
        self.transition(NegotiationPhase::Stable)
    }

    /// Applies the answer to our offer. A second answer is a conflict and
    /// leaves the connection untouched.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> MeshResult<()> {
        if self.remote_description_set {
            return Err(MeshError::conflict(
                &self.participant,
                "answer after remote description was set",
            ));
        }
        if self.phase != NegotiationPhase::OfferSent {
            return Err(MeshError::conflict(
                &self.participant,
                format!("answer while {:?}", self.phase),
            ));
        }
        self.transition(NegotiationPhase::AnswerPending)?;
        self.link.set_remote_description(answer.clone()).await?;
        self.remote_description_set = true;
        self.remote_description = Some(answer);
        self.flush_pending_candidates().await;
        self.transition(NegotiationPhase::Stable)
    }

    /// Applies the candidate now if the remote description is set, otherwise
    /// queues it. Returns whether it was applied. A candidate the link rejects
    /// comes back as a signaling error for the caller to drop.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> MeshResult<bool> {
        if !self.remote_description_set {
            self.pending_remote_candidates.push_back(candidate);
            tracing::trace!(
                target: LOG_TARGET,
                participant = %self.participant,
                queued = self.pending_remote_candidates.len(),
                "buffered remote candidate"
            );
            return Ok(false);
        }
        self.link
            .add_ice_candidate(candidate)
            .await
            .map_err(|err| MeshError::Signaling(format!("candidate rejected: {err}")))?;
        Ok(true)
    }

    /// Applies every queued candidate in arrival order. Rejected candidates
    /// are logged and skipped. Returns how many were applied.
    pub async fn flush_pending_candidates(&mut self) -> usize {
        let mut applied = 0;
        while let Some(candidate) = self.pending_remote_candidates.pop_front() {
            match self.link.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(err) => tracing::warn!(
                    target: LOG_TARGET,
                    participant = %self.participant,
                    error = %err,
                    "dropping buffered candidate"
                ),
            }
        }
        if applied > 0 {
            tracing::debug!(
                target: LOG_TARGET,
                participant = %self.participant,
                applied,
                "applied buffered candidates"
            );
        }
        applied
    }

    /// Adds a remote track to the participant's stream. Returns the stream
    /// when it changed.
    pub fn record_remote_track(&mut self, track: Arc<dyn RemoteTrack>) -> Option<MediaStream> {
        let stream = self
            .remote_stream
            .get_or_insert_with(|| MediaStream::new(track.stream_id()));
        if !stream.add_track(track) {
            return None;
        }
        Some(stream.clone())
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.phase.is_in_flight() && now.saturating_duration_since(self.phase_started) >= timeout
    }

    /// Created by early candidates and never claimed by a roster, join or
    /// offer within `timeout`.
    pub fn is_orphaned(&self, now: Instant, timeout: Duration) -> bool {
        self.role == Role::Unassigned
            && self.phase == NegotiationPhase::Unassigned
            && !self.pending_remote_candidates.is_empty()
            && now.saturating_duration_since(self.phase_started) >= timeout
    }

    /// Moves to `Closed` and releases the link.
    pub async fn close(&mut self) -> MeshResult<()> {
        self.phase = NegotiationPhase::Closed;
        self.pending_remote_candidates.clear();
        self.link.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{LinkCall, LinkOp, MockLink};

    fn state(link: MockLink) -> NegotiationState {
        NegotiationState::new(ParticipantId::from(7), 1, Box::new(link), true)
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn transition_table() {
        use NegotiationPhase::*;
        assert!(Unassigned.can_transition_to(OfferPending));
        assert!(Unassigned.can_transition_to(AnsweringOffer));
        assert!(OfferSent.can_transition_to(AnswerPending));
        assert!(AnswerSent.can_transition_to(Stable));
        assert!(Stable.can_transition_to(Closed));
        assert!(!Stable.can_transition_to(OfferPending));
        assert!(!OfferSent.can_transition_to(Stable));
        assert!(!Unassigned.can_transition_to(Stable));
    }

    #[test]
    fn role_is_assigned_once() {
        let mut state = state(MockLink::detached());
        assert!(state.assign_role(Role::Responder));
        assert!(!state.assign_role(Role::Initiator));
        assert_eq!(state.role(), Role::Responder);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn initiator_reaches_stable() {
        let link = MockLink::detached();
        let ops = link.ops();
        let mut state = state(link);
        state.assign_role(Role::Initiator);

        let offer = state.start_offer().await.unwrap();
        assert_eq!(state.phase(), NegotiationPhase::OfferPending);
        state.mark_offer_sent().unwrap();
        assert!(state.local_description_set());

        state
            .accept_answer(SessionDescription::answer("remote answer"))
            .await
            .unwrap();
        assert_eq!(state.phase(), NegotiationPhase::Stable);
        assert_eq!(
            state.remote_description(),
            Some(&SessionDescription::answer("remote answer"))
        );
        assert_eq!(
            ops.snapshot(),
            vec![
                LinkOp::CreateOffer,
                LinkOp::SetLocal(offer),
                LinkOp::SetRemote(SessionDescription::answer("remote answer")),
            ]
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn duplicate_answer_is_a_no_op() {
        let link = MockLink::detached();
        let ops = link.ops();
        let mut state = state(link);
        state.assign_role(Role::Initiator);
        state.start_offer().await.unwrap();
        state.mark_offer_sent().unwrap();
        state
            .accept_answer(SessionDescription::answer("a"))
            .await
            .unwrap();
        let before = ops.snapshot();

        let err = state
            .accept_answer(SessionDescription::answer("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Conflict { .. }));
        assert_eq!(state.phase(), NegotiationPhase::Stable);
        assert_eq!(ops.snapshot(), before);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn buffered_candidates_apply_in_order_before_new_ones() {
        let link = MockLink::detached();
        let ops = link.ops();
        let mut state = state(link);

        assert!(!state.add_remote_candidate(candidate(1)).await.unwrap());
        assert!(!state.add_remote_candidate(candidate(2)).await.unwrap());
        assert_eq!(state.pending_candidates(), 2);

        state
            .accept_offer(SessionDescription::offer("remote offer"))
            .await
            .unwrap();
        assert_eq!(state.role(), Role::Responder);
        assert!(state.add_remote_candidate(candidate(3)).await.unwrap());

        let applied: Vec<String> = ops
            .snapshot()
            .into_iter()
            .filter_map(|op| match op {
                LinkOp::AddCandidate(c) => Some(c.candidate),
                _ => None,
            })
            .collect();
        assert_eq!(
            applied,
            vec![candidate(1).candidate, candidate(2).candidate, candidate(3).candidate]
        );
        // Buffered candidates go in right after the remote description.
        let snapshot = ops.snapshot();
        assert!(matches!(snapshot[0], LinkOp::SetRemote(_)));
        assert!(matches!(snapshot[1], LinkOp::AddCandidate(_)));
        assert!(matches!(snapshot[2], LinkOp::AddCandidate(_)));
        assert_eq!(state.pending_candidates(), 0);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn responder_answers_and_becomes_stable() {
        let mut state = state(MockLink::detached());
        let answer = state
            .accept_offer(SessionDescription::offer("o"))
            .await
            .unwrap();
        assert_eq!(answer.sdp_type, crate::signaling::SdpType::Answer);
        assert_eq!(state.phase(), NegotiationPhase::AnsweringOffer);
        state.mark_answer_sent().unwrap();
        assert_eq!(state.phase(), NegotiationPhase::Stable);
        assert!(state.local_description_set() && state.remote_description_set());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn offers_that_would_glare_are_conflicts() {
        let mut initiator = state(MockLink::detached());
        initiator.assign_role(Role::Initiator);
        initiator.start_offer().await.unwrap();
        initiator.mark_offer_sent().unwrap();
        let err = initiator
            .accept_offer(SessionDescription::offer("competing"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Conflict { .. }));
        assert_eq!(initiator.phase(), NegotiationPhase::OfferSent);

        let mut responder = state(MockLink::detached());
        responder
            .accept_offer(SessionDescription::offer("first"))
            .await
            .unwrap();
        responder.mark_answer_sent().unwrap();
        assert!(
            responder
                .accept_offer(SessionDescription::offer("second"))
                .await
                .is_err()
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn rejected_candidate_is_not_fatal() {
        let link = MockLink::detached();
        link.fail_on(LinkCall::AddIceCandidate);
        let mut state = state(link);
        state.add_remote_candidate(candidate(1)).await.unwrap();
        state
            .accept_offer(SessionDescription::offer("o"))
            .await
            .unwrap();
        assert_eq!(state.pending_candidates(), 0);
        let err = state.add_remote_candidate(candidate(2)).await.unwrap_err();
        assert!(matches!(err, MeshError::Signaling(_)));
        assert_eq!(state.phase(), NegotiationPhase::AnsweringOffer);
    }

    #[test_timeout::tokio_timeout_test(5, paused)]
    async fn only_in_flight_phases_time_out() {
        let timeout = Duration::from_secs(15);
        let mut state = state(MockLink::detached());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!state.is_timed_out(Instant::now(), timeout));

        state.assign_role(Role::Initiator);
        state.start_offer().await.unwrap();
        state.mark_offer_sent().unwrap();
        tokio::time::advance(Duration::from_secs(14)).await;
        assert!(!state.is_timed_out(Instant::now(), timeout));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(state.is_timed_out(Instant::now(), timeout));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn close_releases_link() {
        let link = MockLink::detached();
        let ops = link.ops();
        let mut state = state(link);
        state.add_remote_candidate(candidate(1)).await.unwrap();
        state.close().await.unwrap();
        assert_eq!(state.phase(), NegotiationPhase::Closed);
        assert_eq!(state.pending_candidates(), 0);
        assert_eq!(ops.snapshot(), vec![LinkOp::Close]);
    }
}
