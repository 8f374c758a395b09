//! Call types and data structures

use crate::identity::{Participant, PeerId, UserId};
use crate::session::RecordingArtifact;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call attempt
///
/// Local to one client: the two sides of a call each mint their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signaling room identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    /// Create a room identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty or whitespace only
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media constraints for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Constraints for a call with the given video flag
    ///
    /// The microphone is always requested.
    pub fn for_call(is_video: bool) -> Self {
        if is_video {
            Self::video_call()
        } else {
            Self::audio_only()
        }
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }
}

/// Call type as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio-only call
    Audio,
    /// Audio and video call
    Video,
}

impl CallType {
    /// Call type for a video flag
    pub fn from_video(is_video: bool) -> Self {
        if is_video {
            Self::Video
        } else {
            Self::Audio
        }
    }

    /// Whether this is a video call
    pub fn is_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Terminal status of a call, reported in `call:end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// A session was established
    Completed,
    /// Outgoing call ended before the callee ever answered
    Missed,
    /// Any other termination
    Cancelled,
}

impl CallStatus {
    /// Derive the status at termination time
    ///
    /// `completed` when a session existed, `missed` when the local side was
    /// the caller and no session ever formed, `cancelled` otherwise.
    pub fn derive(had_session: bool, direction: CallDirection) -> Self {
        match (had_session, direction) {
            (true, _) => Self::Completed,
            (false, CallDirection::Outgoing) => Self::Missed,
            (false, CallDirection::Incoming) => Self::Cancelled,
        }
    }
}

/// Which side started the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// The local user placed the call
    Outgoing,
    /// The local user received the call
    Incoming,
}

/// Call state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No call in progress
    Idle,
    /// Ringing the remote side
    Outgoing,
    /// Remote side is ringing us
    Incoming,
    /// Session established
    Connected,
}

/// A call that has been placed or received but not yet answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    /// Local call identifier
    pub call_id: CallId,
    /// Direction of the pending call
    pub direction: CallDirection,
    /// Whether video was requested
    pub is_video: bool,
    /// The other side (callee for outgoing, caller for incoming)
    pub counterparty: Participant,
    /// Signaling room for this attempt
    pub room: RoomId,
    /// Group call flag
    pub is_group: bool,
    /// Transport identifier the remote side already announced, if any
    pub remote_peer_id: Option<PeerId>,
}

/// Grid dimensions for rendering remote video tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridLayout {
    /// Number of columns
    pub columns: u8,
    /// Number of rows
    pub rows: u8,
}

impl GridLayout {
    /// Total tile slots
    pub fn slots(&self) -> usize {
        usize::from(self.columns) * usize::from(self.rows)
    }
}

impl std::fmt::Display for GridLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.columns, self.rows)
    }
}

/// Video resolution options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoResolution {
    /// 320x240
    QVGA240,
    /// 640x480
    SD480,
    /// 1280x720
    HD720,
    /// 1920x1080
    HD1080,
}

impl VideoResolution {
    /// Get width in pixels
    pub fn width(&self) -> u32 {
        match self {
            Self::QVGA240 => 320,
            Self::SD480 => 640,
            Self::HD720 => 1280,
            Self::HD1080 => 1920,
        }
    }

    /// Get height in pixels
    pub fn height(&self) -> u32 {
        match self {
            Self::QVGA240 => 240,
            Self::SD480 => 480,
            Self::HD720 => 720,
            Self::HD1080 => 1080,
        }
    }
}

/// Metadata describing a finished call attempt
///
/// This is what the call history surface persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSummary {
    /// Local call identifier
    pub call_id: CallId,
    /// Signaling room
    pub room: RoomId,
    /// Audio or video
    pub call_type: CallType,
    /// Who placed the call
    pub caller_id: UserId,
    /// Everyone involved, caller included
    pub participants: Vec<UserId>,
    /// Whole seconds the session lasted (0 if none formed)
    pub duration_secs: u64,
    /// Terminal status
    pub status: CallStatus,
    /// When the call ended
    pub ended_at: DateTime<Utc>,
}

/// Why a call went back to idle without a local hangup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up or cancelled
    Local,
    /// Remote side hung up or cancelled
    Remote,
    /// Nobody answered within the ring timeout
    Timeout,
    /// The media link to the only peer failed
    PeerLost,
}

/// Call event for notifications
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// We started ringing someone
    OutgoingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is being called
        callee: Participant,
        /// Signaling room
        room: RoomId,
        /// Video flag
        is_video: bool,
    },
    /// Someone is ringing us
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        caller: Participant,
        /// Signaling room
        room: RoomId,
        /// Video flag
        is_video: bool,
    },
    /// An incoming call arrived while busy and was not surfaced
    IncomingCallIgnored {
        /// Who tried to call
        caller: Participant,
        /// Whether a busy reject was sent back
        replied_busy: bool,
    },
    /// A session formed
    CallConnected {
        /// Call identifier
        call_id: CallId,
        /// Remote participants
        participants: Vec<Participant>,
        /// Video flag
        is_video: bool,
    },
    /// Another participant joined a running group session
    ParticipantJoined {
        /// Call identifier
        call_id: CallId,
        /// The newcomer
        participant: Participant,
    },
    /// The remote side declined
    CallRejected {
        /// Attempt summary
        summary: CallSummary,
        /// User-visible notice
        notice: String,
    },
    /// The server reported the call could not be placed
    CallFailed {
        /// Call identifier
        call_id: CallId,
        /// Reason reported by the server
        reason: String,
    },
    /// Local media could not be captured
    MediaAccessFailed {
        /// Error description
        reason: String,
    },
    /// The call reached a terminal state
    CallEnded {
        /// Attempt summary
        summary: CallSummary,
        /// What triggered the end
        reason: EndReason,
    },
    /// Recording of a remote stream started
    RecordingStarted {
        /// Call identifier
        call_id: CallId,
        /// Recorded peer
        peer: PeerId,
    },
    /// Recording stopped and produced an artifact
    RecordingFinished {
        /// The recording
        artifact: RecordingArtifact,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_room_ids_sort_by_name() {
        let rooms: std::collections::BTreeSet<RoomId> = ["u1_u2", "team", "u1_u2"]
            .into_iter()
            .map(RoomId::new)
            .collect();
        let names: Vec<&str> = rooms.iter().map(RoomId::as_str).collect();
        assert_eq!(names, vec!["team", "u1_u2"]);
    }

    #[test]
    fn test_media_constraints_for_call() {
        let audio = MediaConstraints::for_call(false);
        assert!(audio.audio);
        assert!(!audio.has_video());

        let video = MediaConstraints::for_call(true);
        assert!(video.audio);
        assert!(video.has_video());
    }

    #[test]
    fn test_status_derivation() {
        assert_eq!(
            CallStatus::derive(true, CallDirection::Outgoing),
            CallStatus::Completed
        );
        assert_eq!(
            CallStatus::derive(true, CallDirection::Incoming),
            CallStatus::Completed
        );
        assert_eq!(
            CallStatus::derive(false, CallDirection::Outgoing),
            CallStatus::Missed
        );
        assert_eq!(
            CallStatus::derive(false, CallDirection::Incoming),
            CallStatus::Cancelled
        );
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&CallType::Video).unwrap(), "\"video\"");
        assert_eq!(
            serde_json::to_string(&CallStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn test_video_resolution() {
        let hd720 = VideoResolution::HD720;
        assert_eq!(hd720.width(), 1280);
        assert_eq!(hd720.height(), 720);
    }
}
