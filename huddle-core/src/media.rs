//! Local media acquisition and stream handles
//!
//! # Architecture
//!
//! The platform capture capability is abstracted behind [`MediaDevices`]. The
//! [`MediaAcquisition`] component is the only owner of the local capture: it
//! guarantees at most one [`LocalStream`] is live at a time and exposes the
//! mute/camera toggles on top of its tracks. Everything else (the peer link
//! manager, connections) only holds `Arc` clones to send media outward.
//!
//! Inbound media is represented by [`RemoteStream`], a fan-out of
//! [`MediaFrame`]s that players and recorders subscribe to.

use crate::config::{CaptureSettings, FacingMode};
use crate::identity::PeerId;
use crate::types::MediaConstraints;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Frames buffered per stream before slow subscribers start lagging
const FRAME_BUFFER: usize = 512;

/// Media capture errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    /// The user or platform refused access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No device of the requested kind
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device exists but could not be opened
    #[error("Device unavailable: {0}")]
    Unavailable(String),
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

/// Audio processing requested from the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    /// Echo cancellation
    pub echo_cancellation: bool,
    /// Noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
}

/// Camera request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    /// Ideal width in pixels
    pub width: u32,
    /// Ideal height in pixels
    pub height: u32,
    /// Preferred camera
    pub facing_mode: FacingMode,
}

/// Full request handed to the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    /// Audio request (always present)
    pub audio: AudioConstraints,
    /// Camera request, `None` for audio-only
    pub video: Option<VideoConstraints>,
}

impl CaptureConstraints {
    /// Build the device request for a call
    pub fn new(constraints: MediaConstraints, settings: &CaptureSettings) -> Self {
        let audio = AudioConstraints {
            echo_cancellation: settings.echo_cancellation,
            noise_suppression: settings.noise_suppression,
            auto_gain_control: settings.auto_gain_control,
        };
        let video = constraints.has_video().then(|| VideoConstraints {
            width: settings.preferred_resolution.width(),
            height: settings.preferred_resolution.height(),
            facing_mode: settings.facing_mode,
        });
        Self { audio, video }
    }

    /// Whether a camera is requested
    pub fn wants_video(&self) -> bool {
        self.video.is_some()
    }
}

/// One encoded media frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    /// Kind of the originating track
    pub kind: TrackKind,
    /// Encoded payload
    pub data: Bytes,
}

impl MediaFrame {
    /// Audio frame
    pub fn audio(data: impl Into<Bytes>) -> Self {
        Self {
            kind: TrackKind::Audio,
            data: data.into(),
        }
    }

    /// Video frame
    pub fn video(data: impl Into<Bytes>) -> Self {
        Self {
            kind: TrackKind::Video,
            data: data.into(),
        }
    }
}

/// A captured local track
#[derive(Debug)]
pub struct LocalTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Device label
    pub label: String,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl LocalTrack {
    /// Create an enabled, live track
    pub fn new(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    /// Whether the track currently produces media
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the device handle is still held
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Release the device handle. Stopping twice is harmless.
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Captured local stream
#[derive(Debug)]
pub struct LocalStream {
    /// Stream identifier
    pub id: String,
    tracks: Vec<Arc<LocalTrack>>,
    frames: broadcast::Sender<MediaFrame>,
}

impl LocalStream {
    /// Create a stream over the given tracks
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        Self {
            id: id.into(),
            tracks: tracks.into_iter().map(Arc::new).collect(),
            frames,
        }
    }

    /// All tracks in capture order
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// First track of the given kind
    pub fn first_track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Whether the stream carries a camera track
    pub fn has_video(&self) -> bool {
        self.first_track(TrackKind::Video).is_some()
    }

    /// Whether any track still holds its device
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Feed a captured frame to outbound subscribers
    ///
    /// Frames from a disabled or stopped track are dropped. Returns whether
    /// the frame was forwarded.
    pub fn publish(&self, frame: MediaFrame) -> bool {
        let forwarded = self
            .first_track(frame.kind)
            .is_some_and(|t| t.is_enabled() && t.is_live());
        if forwarded {
            let _ = self.frames.send(frame);
        }
        forwarded
    }

    /// Subscribe to frames leaving this stream
    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.frames.subscribe()
    }
}

/// Inbound stream received from a remote peer
#[derive(Debug)]
pub struct RemoteStream {
    /// Stream identifier
    pub id: String,
    /// Sending peer
    pub peer: PeerId,
    /// Kinds of media carried
    pub kinds: Vec<TrackKind>,
    frames: broadcast::Sender<MediaFrame>,
}

impl RemoteStream {
    /// Create a remote stream handle
    pub fn new(id: impl Into<String>, peer: PeerId, kinds: Vec<TrackKind>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        Self {
            id: id.into(),
            peer,
            kinds,
            frames,
        }
    }

    /// Whether the stream carries video
    pub fn has_video(&self) -> bool {
        self.kinds.contains(&TrackKind::Video)
    }

    /// Deliver a frame to subscribers, returning how many received it
    pub fn push(&self, frame: MediaFrame) -> usize {
        self.frames.send(frame).unwrap_or(0)
    }

    /// Subscribe to inbound frames
    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.frames.subscribe()
    }
}

/// Platform capture capability
///
/// Implement this over whatever the platform offers (browser media devices,
/// cpal/camera crates, a test double).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open capture devices matching `constraints`
    ///
    /// May suspend indefinitely while the user decides on a permission prompt.
    ///
    /// # Errors
    ///
    /// Returns error if permission is denied or no matching device exists
    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<LocalStream, MediaAccessError>;
}

/// Media events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// A capture started
    StreamStarted {
        /// Stream identifier
        stream_id: String,
        /// Whether a camera is included
        video: bool,
    },
    /// A capture was stopped
    StreamStopped {
        /// Stream identifier
        stream_id: String,
    },
    /// A track was enabled or disabled
    TrackToggled {
        /// Kind of the toggled track
        kind: TrackKind,
        /// New enabled state
        enabled: bool,
    },
}

/// Exclusive owner of the local capture
pub struct MediaAcquisition {
    devices: Arc<dyn MediaDevices>,
    settings: CaptureSettings,
    current: Option<Arc<LocalStream>>,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl MediaAcquisition {
    /// Create the component over a capture capability
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>, settings: CaptureSettings) -> Self {
        let (event_sender, _) = broadcast::channel(64);
        Self {
            devices,
            settings,
            current: None,
            event_sender,
        }
    }

    /// Capture microphone, plus camera when `wants_video`
    ///
    /// Any previous capture is stopped before the new request so two
    /// captures never run at once.
    ///
    /// # Errors
    ///
    /// Returns error if the platform denies access or has no device.
    pub async fn acquire(&mut self, wants_video: bool) -> Result<Arc<LocalStream>, MediaAccessError> {
        self.release();

        let constraints =
            CaptureConstraints::new(MediaConstraints::for_call(wants_video), &self.settings);
        let stream = match self.devices.get_user_media(&constraints).await {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                tracing::warn!(video = wants_video, error = %e, "Media acquisition failed");
                return Err(e);
            }
        };

        tracing::info!(
            stream_id = %stream.id,
            tracks = stream.tracks().len(),
            video = stream.has_video(),
            "Local media acquired"
        );
        let _ = self.event_sender.send(MediaEvent::StreamStarted {
            stream_id: stream.id.clone(),
            video: stream.has_video(),
        });
        self.current = Some(Arc::clone(&stream));
        Ok(stream)
    }

    /// Stop the current capture, if any
    pub fn release(&mut self) {
        if let Some(stream) = self.current.take() {
            stream.stop_all();
            tracing::debug!(stream_id = %stream.id, "Local media released");
            let _ = self.event_sender.send(MediaEvent::StreamStopped {
                stream_id: stream.id.clone(),
            });
        }
    }

    /// Stop `stream` only if it is still the current capture
    ///
    /// Returns whether it was released.
    pub fn release_if_current(&mut self, stream: &Arc<LocalStream>) -> bool {
        let current = self
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, stream));
        if current {
            self.release();
        }
        current
    }

    /// Current local stream
    #[must_use]
    pub fn local_stream(&self) -> Option<Arc<LocalStream>> {
        self.current.clone()
    }

    /// Flip the first audio track; `None` when there is no audio track
    pub fn toggle_mute(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio)
    }

    /// Flip the first video track; `None` when there is no video track
    pub fn toggle_camera(&self) -> Option<bool> {
        self.toggle(TrackKind::Video)
    }

    /// Whether the microphone is muted (false without a capture)
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.track_enabled(TrackKind::Audio) == Some(false)
    }

    /// Whether the camera is on
    #[must_use]
    pub fn is_camera_on(&self) -> bool {
        self.track_enabled(TrackKind::Video) == Some(true)
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }

    fn track_enabled(&self, kind: TrackKind) -> Option<bool> {
        self.current
            .as_ref()
            .and_then(|s| s.first_track(kind))
            .map(|t| t.is_enabled())
    }

    fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let track = self.current.as_ref()?.first_track(kind)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!(kind = ?kind, enabled, "Track toggled");
        let _ = self
            .event_sender
            .send(MediaEvent::TrackToggled { kind, enabled });
        Some(enabled)
    }
}
