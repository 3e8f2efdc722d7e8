//! Drives one full-mesh session: reacts to roster and signaling events,
//! decides who offers to whom, and keeps every per-peer negotiation moving
//! until the session ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{MeshError, MeshResult};
use crate::media::{MediaBundle, MeshView, Notice};
use crate::negotiation::{NegotiationPhase, Role};
use crate::peer::{LinkEvent, LinkEventKind, LinkState, PeerConnector};
use crate::registry::PeerRegistry;
use crate::signaling::{
    IceCandidate, InboundEvent, OutboundSignal, ParticipantId, SessionDescription,
    SignalEnvelope, SignalPayload, SignalSink,
};

const LOG_TARGET: &str = "meshcall::mesh";

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// How long a negotiation may sit in one in-flight phase.
    pub negotiation_timeout: Duration,
    pub sweep_interval: Duration,
    /// Fresh attempts allowed per participant after a failure.
    pub max_connection_retries: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(1),
            max_connection_retries: 1,
        }
    }
}

/// The side with the larger id offers. Both ends of a pair compute the same
/// answer no matter which event brought them together.
pub fn initiator_for<'a>(a: &'a ParticipantId, b: &'a ParticipantId) -> &'a ParticipantId {
    if a > b { a } else { b }
}

pub fn role_for(local: &ParticipantId, remote: &ParticipantId) -> Role {
    if initiator_for(local, remote) == local {
        Role::Initiator
    } else {
        Role::Responder
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The user asked to leave.
    Left,
    /// The signaling channel went away.
    ChannelLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    End(SessionEnd),
}

pub struct MeshOrchestrator {
    local_id: ParticipantId,
    registry: PeerRegistry,
    sink: Arc<dyn SignalSink>,
    view: Arc<dyn MeshView>,
    config: MeshConfig,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    failures: HashMap<ParticipantId, u32>,
}

impl MeshOrchestrator {
    pub fn new(
        local_id: ParticipantId,
        connector: Arc<dyn PeerConnector>,
        media: MediaBundle,
        sink: Arc<dyn SignalSink>,
        view: Arc<dyn MeshView>,
        config: MeshConfig,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        Self {
            local_id,
            registry: PeerRegistry::new(connector, media, link_tx),
            sink,
            view,
            config,
            link_rx,
            failures: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Failures recorded for `participant` since it last left.
    pub fn failure_count(&self, participant: &ParticipantId) -> u32 {
        self.failures.get(participant).copied().unwrap_or(0)
    }

    /// Runs until the user leaves or the channel is lost, then tears down
    /// every connection.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<InboundEvent>,
        mut leave: oneshot::Receiver<()>,
    ) -> SessionEnd {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                _ = &mut leave => {
                    tracing::info!(target: LOG_TARGET, local = %self.local_id, "leaving room");
                    break SessionEnd::Left;
                }
                event = inbound.recv() => {
                    let event = event.unwrap_or(InboundEvent::Disconnected);
                    if let Flow::End(end) = self.handle_inbound(event).await {
                        break end;
                    }
                }
                Some(event) = self.link_rx.recv() => {
                    self.handle_link_event(event).await;
                }
                _ = sweep.tick() => {
                    self.sweep_timeouts().await;
                }
            }
        };

        self.shutdown().await;
        end
    }

    pub async fn handle_inbound(&mut self, event: InboundEvent) -> Flow {
        match event {
            InboundEvent::Roster(participants) => {
                tracing::info!(
                    target: LOG_TARGET,
                    local = %self.local_id,
                    peers = participants.len(),
                    "roster received"
                );
                for participant in participants {
                    self.make_contact(participant).await;
                }
            }
            InboundEvent::Joined(participant) => {
                tracing::info!(target: LOG_TARGET, participant = %participant, "participant joined");
                self.make_contact(participant).await;
            }
            InboundEvent::Left(participant) => {
                tracing::info!(target: LOG_TARGET, participant = %participant, "participant left");
                self.failures.remove(&participant);
                if self.registry.remove(&participant).await {
                    self.view.detach_stream(&participant);
                }
            }
            InboundEvent::Signal(envelope) => {
                let participant = envelope.sender.clone();
                let result = self.handle_signal(envelope).await;
                self.settle(&participant, result).await;
            }
            InboundEvent::Disconnected => {
                tracing::error!(
                    target: LOG_TARGET,
                    local = %self.local_id,
                    peers = self.registry.len(),
                    "signaling channel lost"
                );
                self.view.notify(Notice::ChannelLost);
                return Flow::End(SessionEnd::ChannelLost);
            }
        }
        Flow::Continue
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let LinkEvent {
            participant,
            generation,
            kind,
        } = event;
        let Some(state) = self.registry.get_mut(&participant) else {
            tracing::trace!(target: LOG_TARGET, participant = %participant, generation, "link event for unknown participant");
            return;
        };
        if state.generation() != generation {
            tracing::trace!(
                target: LOG_TARGET,
                participant = %participant,
                generation,
                current = state.generation(),
                "stale link event"
            );
            return;
        }

        match kind {
            LinkEventKind::LocalCandidate(candidate) => {
                let result = self.send(&participant, SignalPayload::Ice(candidate));
                self.settle(&participant, result).await;
            }
            LinkEventKind::RemoteTrack(track) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    participant = %participant,
                    track = %track.id(),
                    kind = ?track.kind(),
                    "remote track"
                );
                if let Some(stream) = state.record_remote_track(track) {
                    self.view.attach_stream(&participant, stream);
                }
            }
            LinkEventKind::StateChanged(link_state) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    participant = %participant,
                    generation,
                    state = ?link_state,
                    "link state"
                );
                if link_state == LinkState::Connected {
                    tracing::info!(target: LOG_TARGET, participant = %participant, "peer connected");
                }
                if link_state.is_terminal() && state.phase() != NegotiationPhase::Closed {
                    let reason = format!("connection {link_state:?}");
                    self.fail_and_retry(&participant, &reason).await;
                }
            }
        }
    }

    /// Handles every link event already queued, for callers stepping the
    /// orchestrator by hand instead of through [`run`](Self::run).
    pub async fn drain_link_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.link_rx.try_recv() {
            self.handle_link_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Fails every negotiation that has sat in one in-flight phase for longer
    /// than the configured timeout, and drops entries that only ever received
    /// candidates.
    pub async fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let timeout = self.config.negotiation_timeout;
        let mut expired: Vec<(ParticipantId, NegotiationPhase)> = self
            .registry
            .iter()
            .filter(|(_, state)| state.is_timed_out(now, timeout))
            .map(|(participant, state)| (participant.clone(), state.phase()))
            .collect();
        expired.sort_by(|a, b| a.0.cmp(&b.0));
        for (participant, phase) in expired {
            let reason = format!("negotiation timed out in {phase:?}");
            self.fail_and_retry(&participant, &reason).await;
        }

        let orphaned: Vec<ParticipantId> = self
            .registry
            .iter()
            .filter(|(_, state)| state.is_orphaned(now, timeout))
            .map(|(participant, _)| participant.clone())
            .collect();
        for participant in orphaned {
            tracing::debug!(
                target: LOG_TARGET,
                participant = %participant,
                "dropping candidates from a participant that never joined"
            );
            self.registry.remove(&participant).await;
        }
    }

    /// Closes every connection and clears the grid.
    pub async fn shutdown(&mut self) {
        for participant in self.registry.clear().await {
            self.view.detach_stream(&participant);
        }
        tracing::debug!(target: LOG_TARGET, local = %self.local_id, "mesh torn down");
    }

    /// The `Joined` path: create the entry, apply the tie-break and offer if
    /// this side is the initiator. Failed attempts are retried while the
    /// participant has retries left.
    async fn make_contact(&mut self, participant: ParticipantId) {
        loop {
            let result = self.try_contact(&participant).await;
            let failure = match result {
                Ok(()) => return,
                Err(err) => match self.classify(&participant, err) {
                    Some(reason) => reason,
                    None => return,
                },
            };
            if !self.record_failure(&participant, &failure).await {
                return;
            }
        }
    }

    async fn try_contact(&mut self, participant: &ParticipantId) -> MeshResult<()> {
        if participant == &self.local_id {
            tracing::debug!(target: LOG_TARGET, "ignoring contact with self");
            return Ok(());
        }
        let role = role_for(&self.local_id, participant);
        let state = self
            .registry
            .get_or_create(participant)
            .await
            .map_err(|err| MeshError::connection_failure(participant, err.to_string()))?;
        if !state.assign_role(role) {
            tracing::debug!(
                target: LOG_TARGET,
                participant = %participant,
                role = ?state.role(),
                "already negotiating"
            );
            return Ok(());
        }
        if role == Role::Initiator {
            self.send_offer(participant).await?;
        }
        Ok(())
    }

    async fn send_offer(&mut self, participant: &ParticipantId) -> MeshResult<()> {
        let Some(state) = self.registry.get_mut(participant) else {
            return Err(MeshError::connection_failure(participant, "no negotiation to offer on"));
        };
        let offer = state
            .start_offer()
            .await
            .map_err(|err| as_connection_failure(participant, err))?;
        self.sink
            .send_signal(OutboundSignal::new(participant.clone(), SignalPayload::Offer(offer)))?;
        state.mark_offer_sent()?;
        tracing::debug!(target: LOG_TARGET, participant = %participant, "offer sent");
        Ok(())
    }

    async fn handle_signal(&mut self, envelope: SignalEnvelope) -> MeshResult<()> {
        let SignalEnvelope { sender, payload } = envelope;
        if sender == self.local_id {
            return Err(MeshError::Signaling("signal from our own id".into()));
        }
        tracing::trace!(target: LOG_TARGET, participant = %sender, kind = payload.kind().as_str(), "signal");
        match payload {
            SignalPayload::Offer(offer) => self.on_offer(&sender, offer).await,
            SignalPayload::Answer(answer) => self.on_answer(&sender, answer).await,
            SignalPayload::Ice(candidate) => self.on_remote_candidate(&sender, candidate).await,
        }
    }

    async fn on_offer(&mut self, sender: &ParticipantId, offer: SessionDescription) -> MeshResult<()> {
        if self.is_restart(sender, &offer) {
            tracing::info!(target: LOG_TARGET, participant = %sender, "peer restarted negotiation");
            if self.registry.remove(sender).await {
                self.view.detach_stream(sender);
            }
        }
        let state = self
            .registry
            .get_or_create(sender)
            .await
            .map_err(|err| MeshError::connection_failure(sender, err.to_string()))?;
        let answer = state
            .accept_offer(offer)
            .await
            .map_err(|err| as_connection_failure(sender, err))?;
        self.sink
            .send_signal(OutboundSignal::new(sender.clone(), SignalPayload::Answer(answer)))?;
        state.mark_answer_sent()?;
        tracing::debug!(target: LOG_TARGET, participant = %sender, "answer sent");
        Ok(())
    }

    /// A different offer from the participant that initiates toward us, after
    /// one was already applied, means the remote dropped its connection and
    /// started over. The same offer again is just a duplicate.
    fn is_restart(&self, sender: &ParticipantId, offer: &SessionDescription) -> bool {
        if role_for(&self.local_id, sender) != Role::Responder {
            return false;
        }
        self.registry.get(sender).is_some_and(|state| {
            state.remote_description_set() && state.remote_description() != Some(offer)
        })
    }

    async fn on_answer(&mut self, sender: &ParticipantId, answer: SessionDescription) -> MeshResult<()> {
        let Some(state) = self.registry.get_mut(sender) else {
            return Err(MeshError::conflict(sender, "answer without a negotiation"));
        };
        state
            .accept_answer(answer)
            .await
            .map_err(|err| as_connection_failure(sender, err))?;
        tracing::debug!(target: LOG_TARGET, participant = %sender, "answer applied");
        Ok(())
    }

    async fn on_remote_candidate(
        &mut self,
        sender: &ParticipantId,
        candidate: IceCandidate,
    ) -> MeshResult<()> {
        if !self.registry.contains(sender) && self.gave_up_on(sender) {
            tracing::debug!(target: LOG_TARGET, participant = %sender, "ignoring candidate from unreachable participant");
            return Ok(());
        }
        let state = self
            .registry
            .get_or_create(sender)
            .await
            .map_err(|err| MeshError::connection_failure(sender, err.to_string()))?;
        state.add_remote_candidate(candidate).await?;
        Ok(())
    }

    fn gave_up_on(&self, participant: &ParticipantId) -> bool {
        self.failure_count(participant) > self.config.max_connection_retries
    }

    fn send(&self, participant: &ParticipantId, payload: SignalPayload) -> MeshResult<()> {
        self.sink
            .send_signal(OutboundSignal::new(participant.clone(), payload))
    }

    /// Applies the error taxonomy to the outcome of a per-participant step.
    async fn settle(&mut self, participant: &ParticipantId, result: MeshResult<()>) {
        let Err(err) = result else {
            return;
        };
        if let Some(reason) = self.classify(participant, err) {
            self.fail_and_retry(participant, &reason).await;
        }
    }

    /// Logs errors that need no further action and returns the reason for
    /// the ones that fail the participant's connection.
    fn classify(&self, participant: &ParticipantId, err: MeshError) -> Option<String> {
        match err {
            MeshError::Conflict { reason, .. } => {
                tracing::debug!(target: LOG_TARGET, participant = %participant, %reason, "ignoring negotiation conflict");
                None
            }
            MeshError::Signaling(reason) => {
                tracing::warn!(target: LOG_TARGET, participant = %participant, %reason, "dropping signal");
                None
            }
            // The inbound stream reports the loss; the session ends there.
            err if err.is_session_fatal() => {
                tracing::debug!(target: LOG_TARGET, participant = %participant, "signal not sent; channel closed");
                None
            }
            MeshError::ConnectionFailure { reason, .. } => Some(reason),
            other => Some(other.to_string()),
        }
    }

    async fn fail_and_retry(&mut self, participant: &ParticipantId, reason: &str) {
        if self.record_failure(participant, reason).await {
            self.make_contact(participant.clone()).await;
        }
    }

    /// Tears the connection down and counts the failure. Returns whether the
    /// participant may be contacted again.
    async fn record_failure(&mut self, participant: &ParticipantId, reason: &str) -> bool {
        if self.registry.remove(participant).await {
            self.view.detach_stream(participant);
        }
        let count = self.failures.entry(participant.clone()).or_insert(0);
        *count += 1;
        let attempts = *count;
        if attempts <= self.config.max_connection_retries {
            tracing::warn!(
                target: LOG_TARGET,
                participant = %participant,
                attempts,
                %reason,
                "connection failed; retrying"
            );
            true
        } else {
            tracing::warn!(
                target: LOG_TARGET,
                participant = %participant,
                attempts,
                %reason,
                "connection failed; giving up"
            );
            self.view.notify(Notice::PeerUnreachable {
                participant: participant.clone(),
                reason: reason.to_string(),
            });
            false
        }
    }
}

/// Errors from the link during a negotiation step fail the connection;
/// conflicts and signaling errors keep their meaning.
fn as_connection_failure(participant: &ParticipantId, err: MeshError) -> MeshError {
    match err {
        MeshError::Rtc(reason) | MeshError::Setup(reason) => {
            MeshError::connection_failure(participant, reason)
        }
        other => other,
    }
}
