//! Local media: capture constraints, tracks and the shared capture handle

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::SessionConfig;
use crate::error::{AppError, Result};

/// Stream id used for locally captured tracks
pub const LOCAL_STREAM_ID: &str = "rendezvous-local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub facing_mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
}

/// What to ask the capture device for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

impl MediaConstraints {
    /// Constraints for the configured media, `None` if no media is wanted
    pub fn from_config(config: &SessionConfig) -> Option<Self> {
        if !config.media.any() {
            return None;
        }

        let (width, height) = config.resolution.ideal_size();
        Some(Self {
            video: config.media.video.then(|| VideoConstraints {
                width,
                height,
                facing_mode: "user".to_string(),
            }),
            audio: config.media.audio.then_some(AudioConstraints {
                echo_cancellation: true,
            }),
        })
    }
}

/// Create RTP codec capability for video (VP8)
pub fn video_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Create RTP codec capability for audio (Opus)
pub fn audio_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// One local track, fed with encoded samples by the capture source
#[derive(Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, id: impl Into<String>) -> Self {
        let id = id.into();
        let capability = match kind {
            MediaKind::Video => video_codec_capability(),
            MediaKind::Audio => audio_codec_capability(),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            LOCAL_STREAM_ID.to_string(),
        ));
        Self { id, kind, track }
    }

    /// Underlying sample track, bound into each peer transport
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Write one encoded sample to every transport the track is bound to
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| AppError::DeviceUnavailable(format!("{} write failed: {}", self.id, e)))
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Active local capture, shared read-only by every negotiation
#[derive(Debug)]
pub struct LocalMediaStream {
    tracks: Vec<LocalTrack>,
    stopped: AtomicBool,
}

impl LocalMediaStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Stop capture. Returns `true` only for the call that stopped it.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Local media stopped ({} tracks)", self.tracks.len());
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Source of local media
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire capture matching the constraints
    ///
    /// Fails with `DeviceUnavailable` when no device is available or
    /// permission is refused.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<Arc<LocalMediaStream>>;
}

/// Capture backed by sample tracks that an external encoder writes into
///
/// Acquiring creates one VP8 track and/or one Opus track per the
/// constraints. Written samples reach every connected peer.
#[derive(Default)]
pub struct SampleTrackCapture;

#[async_trait]
impl MediaCapture for SampleTrackCapture {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<Arc<LocalMediaStream>> {
        let mut tracks = Vec::new();
        if let Some(ref video) = constraints.video {
            debug!(
                "Video track {}x{} ({})",
                video.width, video.height, video.facing_mode
            );
            tracks.push(LocalTrack::new(MediaKind::Video, "video0"));
        }
        if constraints.audio.is_some() {
            tracks.push(LocalTrack::new(MediaKind::Audio, "audio0"));
        }
        if tracks.is_empty() {
            return Err(AppError::DeviceUnavailable(
                "no media kind requested".to_string(),
            ));
        }
        Ok(Arc::new(LocalMediaStream::new(tracks)))
    }
}
