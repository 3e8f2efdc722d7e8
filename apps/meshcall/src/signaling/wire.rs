//! JSON shapes exchanged with the signaling relay, and their validation into
//! typed events.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MeshError, MeshResult};

/// Identifier the relay assigns to a participant of a room.
///
/// The relay hands out numbers, but string ids are accepted too. Ordering is
/// only used to break ties between two participants: numbers compare
/// numerically and sort before any string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParticipantId {
    Numeric(u64),
    Text(String),
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantId::Numeric(id) => write!(f, "{id}"),
            ParticipantId::Text(id) => f.write_str(id),
        }
    }
}

impl From<u64> for ParticipantId {
    fn from(value: u64) -> Self {
        ParticipantId::Numeric(value)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        ParticipantId::Text(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        ParticipantId::Text(value)
    }
}

impl std::str::FromStr for ParticipantId {
    type Err = std::convert::Infallible;

    /// Digits become a numeric id so a CLI-supplied `7` matches the relay's `7`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<u64>() {
            Ok(id) => ParticipantId::Numeric(id),
            Err(_) => ParticipantId::Text(s.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Ice => "ice",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// `{type, sdp}` as browsers put it on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// `RTCIceCandidateInit` JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Ice(IceCandidate),
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::Ice(_) => SignalKind::Ice,
        }
    }

    /// Validate the untyped `data` of a signal against its `signal_type`.
    pub fn from_wire(kind: SignalKind, data: Value) -> MeshResult<Self> {
        match kind {
            SignalKind::Offer => {
                let desc = parse_description(kind, data)?;
                if desc.sdp_type != SdpType::Offer {
                    return Err(MeshError::Signaling(format!(
                        "offer signal carries a {:?} description",
                        desc.sdp_type
                    )));
                }
                Ok(SignalPayload::Offer(desc))
            }
            SignalKind::Answer => {
                let desc = parse_description(kind, data)?;
                if desc.sdp_type != SdpType::Answer {
                    return Err(MeshError::Signaling(format!(
                        "answer signal carries a {:?} description",
                        desc.sdp_type
                    )));
                }
                Ok(SignalPayload::Answer(desc))
            }
            SignalKind::Ice => serde_json::from_value::<IceCandidate>(data)
                .map(SignalPayload::Ice)
                .map_err(|err| MeshError::Signaling(format!("invalid ice payload: {err}"))),
        }
    }

    pub fn to_wire(&self) -> MeshResult<(SignalKind, Value)> {
        let data = match self {
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => serde_json::to_value(desc),
            SignalPayload::Ice(candidate) => serde_json::to_value(candidate),
        }
        .map_err(|err| MeshError::Signaling(format!("encode {} payload: {err}", self.kind().as_str())))?;
        Ok((self.kind(), data))
    }
}

fn parse_description(kind: SignalKind, data: Value) -> MeshResult<SessionDescription> {
    serde_json::from_value::<SessionDescription>(data).map_err(|err| {
        MeshError::Signaling(format!("invalid {} payload: {err}", kind.as_str()))
    })
}

/// A validated signal received from another participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub sender: ParticipantId,
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    pub fn new(sender: ParticipantId, payload: SignalPayload) -> Self {
        Self { sender, payload }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }
}

/// A signal addressed to another participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSignal {
    pub to: ParticipantId,
    pub payload: SignalPayload,
}

impl OutboundSignal {
    pub fn new(to: ParticipantId, payload: SignalPayload) -> Self {
        Self { to, payload }
    }

    pub fn into_client_message(self) -> MeshResult<ClientMessage> {
        let (signal_type, data) = self.payload.to_wire()?;
        Ok(ClientMessage::Signal {
            signal_type,
            to: self.to,
            data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Participants already in the room when we joined.
    Roster(Vec<ParticipantId>),
    Joined(ParticipantId),
    Left(ParticipantId),
    Signal(SignalEnvelope),
    /// The relay channel is gone. Always the last event of a session.
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Peers {
        peers: Vec<ParticipantId>,
    },
    PeerJoined {
        user_id: ParticipantId,
    },
    PeerLeft {
        user_id: ParticipantId,
    },
    Signal {
        signal_type: SignalKind,
        from: ParticipantId,
        #[serde(default)]
        data: Value,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn parse(text: &str) -> MeshResult<Self> {
        serde_json::from_str(text)
            .map_err(|err| MeshError::Signaling(format!("unreadable relay message: {err}")))
    }

    /// `Ok(None)` for relay housekeeping (pong, error reports) that carries no
    /// event for the orchestrator.
    pub fn into_event(self) -> MeshResult<Option<InboundEvent>> {
        let event = match self {
            ServerMessage::Peers { peers } => InboundEvent::Roster(peers),
            ServerMessage::PeerJoined { user_id } => InboundEvent::Joined(user_id),
            ServerMessage::PeerLeft { user_id } => InboundEvent::Left(user_id),
            ServerMessage::Signal {
                signal_type,
                from,
                data,
            } => {
                let payload = SignalPayload::from_wire(signal_type, data)?;
                InboundEvent::Signal(SignalEnvelope::new(from, payload))
            }
            ServerMessage::Pong => {
                tracing::trace!(target: "meshcall::signaling", "relay pong");
                return Ok(None);
            }
            ServerMessage::Error { message } => {
                tracing::warn!(target: "meshcall::signaling", %message, "relay reported an error");
                return Ok(None);
            }
        };
        Ok(Some(event))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Signal {
        signal_type: SignalKind,
        to: ParticipantId,
        data: Value,
    },
    Ping,
}
