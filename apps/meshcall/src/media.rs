use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MeshResult;
use crate::signaling::ParticipantId;

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Local outbound tracks for one session. Every peer connection attaches the
/// same tracks; nothing mutates the bundle once the session has started.
#[derive(Clone, Default)]
pub struct MediaBundle {
    tracks: Arc<[LocalTrack]>,
}

impl MediaBundle {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks: tracks.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl fmt::Debug for MediaBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.tracks
                    .iter()
                    .map(|track| format!("{}:{}/{}", track.kind(), track.stream_id(), track.id())),
            )
            .finish()
    }
}

/// Supplies the local audio/video tracks when a session starts.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn capture(&self) -> MeshResult<MediaBundle>;
}

/// Negotiates an Opus and/or VP8 track but never writes samples. Used by the
/// headless client, which has no capture devices.
#[derive(Debug, Clone)]
pub struct SilentCapture {
    pub audio: bool,
    pub video: bool,
    pub stream_id: String,
}

impl Default for SilentCapture {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            stream_id: "meshcall".to_string(),
        }
    }
}

#[async_trait]
impl MediaCapture for SilentCapture {
    async fn capture(&self) -> MeshResult<MediaBundle> {
        let mut tracks: Vec<LocalTrack> = Vec::new();
        if self.audio {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                "audio".to_owned(),
                self.stream_id.clone(),
            )));
        }
        if self.video {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                "video".to_owned(),
                self.stream_id.clone(),
            )));
        }
        Ok(MediaBundle::new(tracks))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
    Unknown,
}

/// A track received from a remote participant.
pub trait RemoteTrack: fmt::Debug + Send + Sync {
    fn id(&self) -> String;
    fn stream_id(&self) -> String;
    fn kind(&self) -> TrackKind;
    /// Lets a renderer reach the backend track (e.g. to read RTP).
    fn as_any(&self) -> &dyn Any;
}

/// Remote tracks grouped by the stream id the sender put them in.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn RemoteTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn RemoteTrack>] {
        &self.tracks
    }

    /// Returns false when a track with the same id is already present.
    pub fn add_track(&mut self, track: Arc<dyn RemoteTrack>) -> bool {
        let id = track.id();
        if self.tracks.iter().any(|existing| existing.id() == id) {
            return false;
        }
        self.tracks.push(track);
        true
    }
}

/// Something the user should see that is not a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A peer failed and used up its retries.
    PeerUnreachable {
        participant: ParticipantId,
        reason: String,
    },
    /// The relay is gone; the user has to rejoin.
    ChannelLost,
}

/// Rendering collaborator: the video grid and the session banner.
pub trait MeshView: Send + Sync {
    fn attach_stream(&self, participant: &ParticipantId, stream: MediaStream);
    fn detach_stream(&self, participant: &ParticipantId);
    fn notify(&self, notice: Notice);
}

/// Reports view changes through `tracing`; the headless client's "grid".
#[derive(Debug, Default)]
pub struct TracingView;

impl MeshView for TracingView {
    fn attach_stream(&self, participant: &ParticipantId, stream: MediaStream) {
        let kinds: Vec<TrackKind> = stream.tracks().iter().map(|track| track.kind()).collect();
        tracing::info!(
            participant = %participant,
            stream = stream.id(),
            tracks = ?kinds,
            "remote stream attached"
        );
    }

    fn detach_stream(&self, participant: &ParticipantId) {
        tracing::info!(participant = %participant, "remote stream detached");
    }

    fn notify(&self, notice: Notice) {
        match notice {
            Notice::PeerUnreachable {
                participant,
                reason,
            } => tracing::warn!(participant = %participant, %reason, "peer unreachable"),
            Notice::ChannelLost => {
                tracing::error!("signaling channel lost; rejoin the room to reconnect")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Track(&'static str);

    impl RemoteTrack for Track {
        fn id(&self) -> String {
            self.0.to_string()
        }
        fn stream_id(&self) -> String {
            "s".to_string()
        }
        fn kind(&self) -> TrackKind {
            TrackKind::Audio
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn stream_ignores_duplicate_track_ids() {
        let mut stream = MediaStream::new("s");
        assert!(stream.add_track(Arc::new(Track("a"))));
        assert!(!stream.add_track(Arc::new(Track("a"))));
        assert!(stream.add_track(Arc::new(Track("b"))));
        assert_eq!(stream.tracks().len(), 2);
    }

    #[tokio::test]
    async fn silent_capture_builds_requested_tracks() {
        let bundle = SilentCapture {
            audio: true,
            video: false,
            stream_id: "me".into(),
        }
        .capture()
        .await
        .unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.tracks()[0].stream_id(), "me");
        assert!(MediaBundle::empty().is_empty());
    }
}
