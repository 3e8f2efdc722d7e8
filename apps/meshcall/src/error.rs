use thiserror::Error;

use crate::signaling::ParticipantId;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("setup failed: {0}")]
    Setup(String),
    /// Malformed or out-of-order signaling input. Dropped by the caller.
    #[error("signaling message rejected: {0}")]
    Signaling(String),
    /// Duplicate or unexpected offer/answer for a connection. Ignored.
    #[error("negotiation conflict with {participant}: {reason}")]
    Conflict {
        participant: ParticipantId,
        reason: String,
    },
    #[error("connection to {participant} failed: {reason}")]
    ConnectionFailure {
        participant: ParticipantId,
        reason: String,
    },
    #[error("webrtc error: {0}")]
    Rtc(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("signaling channel closed")]
    ChannelClosed,
}

impl MeshError {
    pub fn conflict(participant: &ParticipantId, reason: impl Into<String>) -> Self {
        MeshError::Conflict {
            participant: participant.clone(),
            reason: reason.into(),
        }
    }

    pub fn connection_failure(participant: &ParticipantId, reason: impl Into<String>) -> Self {
        MeshError::ConnectionFailure {
            participant: participant.clone(),
            reason: reason.into(),
        }
    }

    /// Only losing the signaling channel ends a session; everything else is
    /// scoped to a single peer or a single message.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, MeshError::ChannelClosed)
    }
}

pub(crate) fn to_rtc_error<E: std::fmt::Display>(err: E) -> MeshError {
    MeshError::Rtc(err.to_string())
}

pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_channel_loss_ends_the_session() {
        let peer = ParticipantId::from(4);
        assert!(MeshError::ChannelClosed.is_session_fatal());
        assert!(!MeshError::connection_failure(&peer, "ice failed").is_session_fatal());
        assert!(!MeshError::conflict(&peer, "second answer").is_session_fatal());
        assert!(!MeshError::Signaling("bad frame".into()).is_session_fatal());
    }
}
