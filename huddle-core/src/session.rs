//! Active call session
//!
//! Created when a call connects and destroyed on any termination. Holds the
//! participants and connected peers, the duration timer and the optional
//! recorder of one remote stream.

use crate::identity::{Participant, PeerId, UserId};
use crate::media::{MediaFrame, RemoteStream};
use crate::types::{CallDirection, CallId, GridLayout, RoomId};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

/// Grid dimensions for `peers` remote video tiles
#[must_use]
pub fn grid_layout(peers: usize) -> GridLayout {
    let (columns, rows) = match peers {
        0 | 1 => (1, 1),
        2 => (2, 1),
        3 | 4 => (2, 2),
        5 | 6 => (3, 2),
        _ => (3, 3),
    };
    GridLayout { columns, rows }
}

/// Seconds counter ticking once per second until dropped
pub struct DurationTimer {
    elapsed: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl DurationTimer {
    /// Start counting from zero
    #[must_use]
    pub fn start() -> Self {
        let (tx, elapsed) = watch::channel(0u64);
        let period = Duration::from_secs(1);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                ticker.tick().await;
                tx.send_modify(|secs| *secs += 1);
            }
        });
        Self { elapsed, task }
    }

    /// Ticks so far
    #[must_use]
    pub fn ticks(&self) -> u64 {
        *self.elapsed.borrow()
    }

    /// Watch the counter
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.elapsed.clone()
    }
}

impl Drop for DurationTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A finished recording of one remote stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingArtifact {
    /// Recording identifier
    pub id: Uuid,
    /// Call the recording belongs to
    pub call_id: CallId,
    /// Recorded peer
    pub peer: PeerId,
    /// `audio/webm` or `video/webm`
    pub mime_type: &'static str,
    /// Concatenated frame payloads
    pub data: Bytes,
    /// Frames captured
    pub frame_count: u64,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// How long the recorder ran
    pub duration: Duration,
}

impl RecordingArtifact {
    /// Suggested file name for saving the artifact
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("call-recording-{}.webm", self.started_at.format("%Y%m%d-%H%M%S"))
    }
}

struct Captured {
    data: BytesMut,
    frames: u64,
}

/// Records the frames of one remote stream until stopped
pub struct Recorder {
    call_id: CallId,
    peer: PeerId,
    mime_type: &'static str,
    started_at: DateTime<Utc>,
    started: Instant,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Captured>,
}

impl Recorder {
    /// Start recording `stream`
    #[must_use]
    pub fn start(call_id: CallId, stream: &RemoteStream) -> Self {
        let mut frames = stream.subscribe();
        let (stop, mut stopped) = oneshot::channel::<()>();
        let peer = stream.peer.clone();

        let task = tokio::spawn(async move {
            let mut captured = Captured {
                data: BytesMut::new(),
                frames: 0,
            };
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    frame = frames.recv() => match frame {
                        Ok(frame) => captured.append(&frame),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Recorder lagging, frames dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            while let Ok(frame) = frames.try_recv() {
                captured.append(&frame);
            }
            captured
        });

        tracing::info!(peer = %peer, call_id = %call_id, "Recording started");
        Self {
            call_id,
            peer,
            mime_type: if stream.has_video() {
                "video/webm"
            } else {
                "audio/webm"
            },
            started_at: Utc::now(),
            started: Instant::now(),
            stop,
            task,
        }
    }

    /// Recorded peer
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Stop and collect the artifact
    ///
    /// # Errors
    ///
    /// Returns the join error if the capture task died
    pub async fn stop(self) -> Result<RecordingArtifact, tokio::task::JoinError> {
        let _ = self.stop.send(());
        let captured = self.task.await?;
        let artifact = RecordingArtifact {
            id: Uuid::new_v4(),
            call_id: self.call_id,
            peer: self.peer,
            mime_type: self.mime_type,
            data: captured.data.freeze(),
            frame_count: captured.frames,
            started_at: self.started_at,
            duration: self.started.elapsed(),
        };
        tracing::info!(
            peer = %artifact.peer,
            frames = artifact.frame_count,
            bytes = artifact.data.len(),
            "Recording stopped"
        );
        Ok(artifact)
    }
}

impl Captured {
    fn append(&mut self, frame: &MediaFrame) {
        self.data.extend_from_slice(&frame.data);
        self.frames += 1;
    }
}

/// State of a connected call
pub struct ActiveCallSession {
    /// Local call identifier
    pub call_id: CallId,
    /// Signaling room
    pub room: RoomId,
    /// Video flag
    pub is_video: bool,
    /// Which side placed the call
    pub direction: CallDirection,
    /// Who placed the call
    pub caller_id: UserId,
    /// Group call flag
    pub is_group: bool,
    participants: Vec<Participant>,
    peers: Vec<PeerId>,
    started_at: Instant,
    started_at_wall: DateTime<Utc>,
    timer: DurationTimer,
    recorder: Option<Recorder>,
}

impl ActiveCallSession {
    /// Start a session with its first remote participant
    #[must_use]
    pub fn start(
        call_id: CallId,
        room: RoomId,
        is_video: bool,
        direction: CallDirection,
        caller_id: UserId,
        is_group: bool,
        first: Participant,
    ) -> Self {
        Self {
            call_id,
            room,
            is_video,
            direction,
            caller_id,
            is_group,
            participants: vec![first],
            peers: Vec::new(),
            started_at: Instant::now(),
            started_at_wall: Utc::now(),
            timer: DurationTimer::start(),
            recorder: None,
        }
    }

    /// Remote participants in join order
    #[must_use]
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Add a participant; returns false if already present
    pub fn add_participant(&mut self, participant: Participant) -> bool {
        if self.participants.iter().any(|p| p.id == participant.id) {
            return false;
        }
        self.participants.push(participant);
        true
    }

    /// Remote peers in connection order
    #[must_use]
    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    /// Track a connected peer; returns false if already tracked
    pub fn add_peer(&mut self, peer: PeerId) -> bool {
        if self.peers.contains(&peer) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    /// Forget a peer that went away; returns false if it was not tracked
    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p != peer);
        self.peers.len() != before
    }

    /// Every user involved, caller first, without duplicates
    #[must_use]
    pub fn participant_ids(&self, local: &UserId) -> Vec<UserId> {
        let mut ids = vec![self.caller_id.clone()];
        let others = std::iter::once(local).chain(self.participants.iter().map(|p| &p.id));
        for id in others {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Whole seconds since the session started
    #[must_use]
    pub fn duration_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Wall-clock start
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at_wall
    }

    /// Watch the per-second counter
    #[must_use]
    pub fn subscribe_duration(&self) -> watch::Receiver<u64> {
        self.timer.subscribe()
    }

    /// Grid for the currently connected peers
    #[must_use]
    pub fn grid_layout(&self) -> GridLayout {
        grid_layout(self.peers.len())
    }

    /// Whether a recording is running
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    /// Start recording `stream`; returns false if already recording
    pub fn start_recording(&mut self, stream: &RemoteStream) -> bool {
        if self.recorder.is_some() {
            return false;
        }
        self.recorder = Some(Recorder::start(self.call_id, stream));
        true
    }

    /// Take the running recorder, if any
    pub fn take_recorder(&mut self) -> Option<Recorder> {
        self.recorder.take()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_grid_layout_table() {
        let cases = [
            (0, (1, 1)),
            (1, (1, 1)),
            (2, (2, 1)),
            (3, (2, 2)),
            (4, (2, 2)),
            (5, (3, 2)),
            (6, (3, 2)),
            (7, (3, 3)),
            (12, (3, 3)),
        ];
        for (peers, (columns, rows)) in cases {
            assert_eq!(grid_layout(peers), GridLayout { columns, rows }, "peers = {peers}");
        }
    }

    proptest! {
        #[test]
        fn grid_fits_up_to_nine_peers(peers in 0usize..64) {
            let grid = grid_layout(peers);
            prop_assert!(grid.slots() >= peers.min(9));
            prop_assert!(grid.columns >= grid.rows);
        }

        #[test]
        fn grid_never_shrinks(peers in 0usize..63) {
            prop_assert!(grid_layout(peers).slots() <= grid_layout(peers + 1).slots());
        }
    }

    fn session() -> ActiveCallSession {
        ActiveCallSession::start(
            CallId::new(),
            RoomId::new("u1_u2"),
            true,
            CallDirection::Outgoing,
            UserId::new("u1"),
            false,
            Participant::new("u2", "bob"),
        )
    }

    #[tokio::test]
    async fn test_participants_are_deduplicated() {
        let mut session = session();
        assert!(!session.add_participant(Participant::new("u2", "bob again")));
        assert!(session.add_participant(Participant::new("u3", "carol")));
        assert_eq!(
            session.participant_ids(&UserId::new("u1")),
            vec![UserId::new("u1"), UserId::new("u2"), UserId::new("u3")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_counts_whole_seconds() {
        let session = session();
        tokio::time::advance(Duration::from_millis(42_900)).await;
        assert_eq!(session.duration_secs(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_every_second() {
        let timer = DurationTimer::start();
        let mut ticks = timer.subscribe();
        for expected in 1..=3 {
            ticks.changed().await.unwrap();
            assert_eq!(*ticks.borrow(), expected);
        }
        assert_eq!(timer.ticks(), 3);
    }

    #[tokio::test]
    async fn test_recorder_collects_frames() {
        let stream = RemoteStream::new("r", PeerId::new("p2"), vec![TrackKind::Audio]);
        let mut session = session();
        assert!(session.start_recording(&stream));
        assert!(!session.start_recording(&stream));

        stream.push(MediaFrame::audio(vec![1u8, 2]));
        stream.push(MediaFrame::audio(vec![3u8]));

        let artifact = session.take_recorder().unwrap().stop().await.unwrap();
        assert_eq!(artifact.data.as_ref(), &[1, 2, 3]);
        assert_eq!(artifact.frame_count, 2);
        assert_eq!(artifact.mime_type, "audio/webm");
        assert_eq!(artifact.peer, PeerId::new("p2"));
        assert!(!session.is_recording());
    }
}
