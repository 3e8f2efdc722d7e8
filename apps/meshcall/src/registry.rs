use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::MeshResult;
use crate::media::MediaBundle;
use crate::negotiation::NegotiationState;
use crate::peer::{LinkEvent, LinkEvents, PeerConnector};
use crate::signaling::ParticipantId;

const LOG_TARGET: &str = "meshcall::registry";

/// Session-scoped map from remote participant to its negotiation.
///
/// At most one entry exists per participant. Each entry gets a fresh
/// generation so events from a replaced link can be told apart.
pub struct PeerRegistry {
    connector: Arc<dyn PeerConnector>,
    media: MediaBundle,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    entries: HashMap<ParticipantId, NegotiationState>,
    next_generation: u64,
}

impl PeerRegistry {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        media: MediaBundle,
        link_events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            connector,
            media,
            link_events,
            entries: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Returns the existing entry, or builds a link with the session's media
    /// attached and callbacks installed and stores a new one.
    pub async fn get_or_create(
        &mut self,
        participant: &ParticipantId,
    ) -> MeshResult<&mut NegotiationState> {
        match self.entries.entry(participant.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(slot) => {
                let generation = self.next_generation;
                self.next_generation += 1;
                let events =
                    LinkEvents::new(participant.clone(), generation, self.link_events.clone());
                let link = self.connector.connect(&self.media, events).await?;
                tracing::debug!(
                    target: LOG_TARGET,
                    participant = %participant,
                    generation,
                    "negotiation created"
                );
                Ok(slot.insert(NegotiationState::new(
                    participant.clone(),
                    generation,
                    link,
                    !self.media.is_empty(),
                )))
            }
        }
    }

    /// Closes and forgets the entry. Returns false when there was none.
    pub async fn remove(&mut self, participant: &ParticipantId) -> bool {
        let Some(mut state) = self.entries.remove(participant) else {
            tracing::trace!(target: LOG_TARGET, participant = %participant, "nothing to remove");
            return false;
        };
        if let Err(err) = state.close().await {
            tracing::warn!(
                target: LOG_TARGET,
                participant = %participant,
                generation = state.generation(),
                error = %err,
                "error closing peer connection"
            );
        }
        tracing::debug!(
            target: LOG_TARGET,
            participant = %participant,
            generation = state.generation(),
            "negotiation removed"
        );
        true
    }

    /// Closes every entry. Returns the participants that were present.
    pub async fn clear(&mut self) -> Vec<ParticipantId> {
        let participants = self.participants();
        for participant in &participants {
            self.remove(participant).await;
        }
        participants
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<&NegotiationState> {
        self.entries.get(participant)
    }

    pub fn get_mut(&mut self, participant: &ParticipantId) -> Option<&mut NegotiationState> {
        self.entries.get_mut(participant)
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.entries.contains_key(participant)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted, so callers iterate deterministically.
    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut participants: Vec<ParticipantId> = self.entries.keys().cloned().collect();
        participants.sort();
        participants
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &NegotiationState)> {
        self.entries.iter()
    }
}
