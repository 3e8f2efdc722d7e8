use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::{LinkEventKind, LinkEvents, LinkState, PeerConnector, PeerLink};
use crate::error::{MeshError, MeshResult, to_rtc_error};
use crate::media::{MediaBundle, RemoteTrack, TrackKind};
use crate::rtc_config::IceServer;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

const LOG_TARGET: &str = "meshcall::peer";

fn build_api() -> MeshResult<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_rtc_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_rtc_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Builds `webrtc` peer connections sharing one API instance per session.
pub struct RtcConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcConnector {
    pub fn new(ice_servers: &[IceServer]) -> MeshResult<Self> {
        Ok(Self {
            api: build_api()?,
            ice_servers: ice_servers.iter().map(RTCIceServer::from).collect(),
        })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        media: &MediaBundle,
        events: LinkEvents,
    ) -> MeshResult<Box<dyn PeerLink>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(to_rtc_error)?,
        );

        for track in media.tracks() {
            if let Err(err) = pc.add_track(Arc::clone(track)).await {
                let _ = pc.close().await;
                return Err(MeshError::Rtc(format!(
                    "attach local track {}: {err}",
                    track.id()
                )));
            }
        }

        let ice_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = ice_events.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.emit(LinkEventKind::LocalCandidate(from_rtc_candidate(init))),
                    Err(err) => tracing::warn!(
                        target: LOG_TARGET,
                        participant = %events.participant(),
                        error = %err,
                        "failed to serialize local candidate"
                    ),
                }
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                track_events.emit(LinkEventKind::RemoteTrack(Arc::new(RtcRemoteTrack::new(
                    track,
                ))));
                Box::pin(async {})
            },
        ));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!(
                target: LOG_TARGET,
                participant = %state_events.participant(),
                generation = state_events.generation(),
                ?state,
                "peer connection state changed"
            );
            state_events.emit(LinkEventKind::StateChanged(link_state(state)));
            Box::pin(async {})
        }));

        tracing::debug!(
            target: LOG_TARGET,
            participant = %events.participant(),
            generation = events.generation(),
            tracks = media.len(),
            "peer connection created"
        );
        Ok(Box::new(RtcPeerLink { pc }))
    }
}

pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> MeshResult<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(to_rtc_error)?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> MeshResult<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(to_rtc_error)?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> MeshResult<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_rtc_error)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> MeshResult<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_rtc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MeshResult<()> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(to_rtc_error)
    }

    async fn close(&self) -> MeshResult<()> {
        self.pc.close().await.map_err(to_rtc_error)
    }
}

/// [`RemoteTrack`] over a `webrtc` receiver track.
pub struct RtcRemoteTrack {
    track: Arc<TrackRemote>,
}

impl RtcRemoteTrack {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        Self { track }
    }
}

impl fmt::Debug for RtcRemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcRemoteTrack")
            .field("id", &self.track.id())
            .field("stream_id", &self.track.stream_id())
            .field("kind", &self.kind())
            .finish()
    }
}

impl RemoteTrack for RtcRemoteTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    fn stream_id(&self) -> String {
        self.track.stream_id()
    }

    fn kind(&self) -> TrackKind {
        match self.track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Unknown,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

fn from_rtc_description(desc: &RTCSessionDescription) -> MeshResult<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(MeshError::Rtc("description without sdp type".into()));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp.clone(),
    })
}

fn to_rtc_description(desc: SessionDescription) -> MeshResult<RTCSessionDescription> {
    let description = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp).map_err(to_rtc_error)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp).map_err(to_rtc_error)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp).map_err(to_rtc_error)?,
        SdpType::Rollback => {
            return Err(MeshError::Rtc("rollback descriptions are not supported".into()));
        }
    };
    Ok(description)
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}
