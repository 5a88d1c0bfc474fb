//! Local media: tracks, streams and the capture source contract

pub mod controller;
pub mod synthetic;

pub use controller::LocalMediaController;
pub use synthetic::SyntheticMediaSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Classified capture failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum MediaError {
    /// The user or platform refused access to the device
    #[error("Permission denied")]
    PermissionDenied,

    /// No matching capture device
    #[error("Device not found")]
    DeviceNotFound,

    /// Anything else, including a cancelled picker
    #[error("Media error: {0}")]
    Other(String),
}

/// Constraints for a user-media request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    /// Request a microphone track
    pub audio: bool,
    /// Request a camera track
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Local capture track
///
/// Cloning yields another handle to the same track. The `enabled` flag
/// mutes without stopping; `stop` ends the track for good and wakes every
/// `ended()` waiter.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    id: String,
    kind: MediaKind,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    local: Arc<TrackLocalStaticSample>,
}

impl MediaTrack {
    /// Create a new track belonging to `stream_id`
    pub fn new(kind: MediaKind, label: impl Into<String>, stream_id: &str) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let codec = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));
        let (ended, _) = watch::channel(false);

        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
                local,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    /// Human-readable device label
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute without stopping capture
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// End the track; idempotent
    pub fn stop(&self) {
        self.inner.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolve once the track has ended, locally or by the platform
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// The RTP track that carries this capture's samples
    pub fn local_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.local)
    }

    /// True if both handles refer to the same track
    pub fn ptr_eq(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// A set of local tracks captured together
#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Create an empty stream with a fresh ID
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks: Vec::new(),
        }
    }

    /// Create and append a track of `kind`
    pub fn with_track(mut self, kind: MediaKind, label: impl Into<String>) -> Self {
        let track = MediaTrack::new(kind, label, &self.id);
        self.tracks.push(track);
        self
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// First video track, if any
    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.tracks_of(MediaKind::Video).next()
    }

    /// First audio track, if any
    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.tracks_of(MediaKind::Audio).next()
    }

    /// Stop every track in the stream
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture device collaborator
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Request a camera/microphone stream
    async fn request_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<MediaStream, MediaError>;

    /// Request a display capture stream (screen picker)
    async fn request_display_media(&self) -> std::result::Result<MediaStream, MediaError>;
}
