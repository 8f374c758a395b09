//! Call signaling state machine
//!
//! [`CallController`] is the single owner of the local call state. It turns
//! local user actions and inbound [`SignalingMessage`]s into transitions,
//! driving the [`PeerLinkManager`] and emitting [`CallEvent`]s.
//!
//! ```text
//!              initiate                 call:accepted
//!     Idle ─────────────────► Outgoing ───────────────┐
//!      ▲  ▲                      │                    ▼
//!      │  │ reject / ended       │ rejected /     Connected
//!      │  │                      │ failed / end       │
//!      │  └──── Incoming ◄───────┼────────────────────┤ end / ended
//!      │   call:incoming │       │                    │
//!      │                 └─ answer ──────────────────►│
//!      └─────────────────────────┴────────────────────┘
//! ```
//!
//! Local media is always acquired before `call:answer` is emitted, so an
//! inbound direct connection always finds a stream to answer with. Every
//! termination path runs [`PeerLinkManager::cleanup`] and lands in
//! [`CallState::Idle`].

use crate::config::{BusyPolicy, CallConfig};
use crate::identity::{Participant, PeerId};
use crate::media::{LocalStream, MediaAccessError};
use crate::peer::{PeerError, PeerEvent, PeerLinkManager};
use crate::room::resolve_room;
use crate::session::{grid_layout, ActiveCallSession, RecordingArtifact};
use crate::signaling::{
    AcceptedPayload, AnswerPayload, EndPayload, EventChannel, IncomingPayload, InitiatePayload,
    RejectPayload, RoutingPayload, SignalingClient, SignalingError, SignalingMessage,
};
use crate::types::{
    CallDirection, CallEvent, CallId, CallState, CallStatus, CallSummary, CallType, EndReason,
    GridLayout, PendingCall, RoomId,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Reject reason sent when a second call arrives under [`BusyPolicy::Reject`]
pub const REASON_BUSY: &str = "busy";

/// Reject reason sent when the callee cannot capture media
pub const REASON_MEDIA_UNAVAILABLE: &str = "media-unavailable";

/// Reject reason sent when the callee's transport never produced an identifier
pub const REASON_PEER_UNAVAILABLE: &str = "peer-unavailable";

/// Call management errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Operation not allowed in the current state
    #[error("Invalid call state: expected {expected}, was {actual:?}")]
    InvalidState {
        /// State the operation needs
        expected: &'static str,
        /// State the controller was in
        actual: CallState,
    },

    /// Local media could not be captured
    #[error("Media error: {0}")]
    Media(#[from] MediaAccessError),

    /// Peer transport failure
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    /// Signaling failure
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// No connected session
    #[error("No active call session")]
    NoActiveSession,

    /// Recording could not be started or finished
    #[error("Recording error: {0}")]
    Recording(String),

    /// A group call needs someone to call
    #[error("Group call needs at least one participant")]
    NoParticipants,
}

/// Internal phase; `Answering` is reported as [`CallState::Incoming`]
enum Phase {
    Idle,
    Outgoing(PendingCall),
    Incoming(PendingCall),
    Answering(PendingCall),
    Connected(ActiveCallSession),
}

impl Phase {
    fn state(&self) -> CallState {
        match self {
            Self::Idle => CallState::Idle,
            Self::Outgoing(_) => CallState::Outgoing,
            Self::Incoming(_) | Self::Answering(_) => CallState::Incoming,
            Self::Connected(_) => CallState::Connected,
        }
    }

    fn room(&self) -> Option<&RoomId> {
        match self {
            Self::Idle => None,
            Self::Outgoing(p) | Self::Incoming(p) | Self::Answering(p) => Some(&p.room),
            Self::Connected(s) => Some(&s.room),
        }
    }

    fn is_ringing(&self) -> bool {
        matches!(self, Self::Outgoing(_) | Self::Incoming(_))
    }
}

/// Snapshot of the call in progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    /// Local call identifier
    pub call_id: CallId,
    /// Current state
    pub state: CallState,
    /// Signaling room
    pub room: RoomId,
    /// Video flag
    pub is_video: bool,
    /// Remote participants
    pub participants: Vec<Participant>,
    /// Seconds since the session started (0 while ringing)
    pub duration_secs: u64,
}

/// The call state machine
///
/// One controller per signed-in user. The generic parameter `C` is the event
/// channel to the chat server.
pub struct CallController<C: EventChannel + 'static> {
    this: Weak<Self>,
    local: Participant,
    signaling: Arc<SignalingClient<C>>,
    peers: Arc<PeerLinkManager>,
    config: CallConfig,
    phase: tokio::sync::Mutex<Phase>,
    state: watch::Sender<CallState>,
    event_sender: broadcast::Sender<CallEvent>,
    ring_timer: Mutex<Option<JoinHandle<()>>>,
    call_room: Mutex<Option<RoomId>>,
}

impl<C: EventChannel + 'static> CallController<C> {
    /// Create a controller for `local`
    #[must_use]
    pub fn new(
        local: Participant,
        signaling: Arc<SignalingClient<C>>,
        peers: Arc<PeerLinkManager>,
        config: CallConfig,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(CallState::Idle);
        let (event_sender, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            local,
            signaling,
            peers,
            config,
            phase: tokio::sync::Mutex::new(Phase::Idle),
            state,
            event_sender,
            ring_timer: Mutex::new(None),
            call_room: Mutex::new(None),
        })
    }

    /// The signed-in participant
    #[must_use]
    pub fn local(&self) -> &Participant {
        &self.local
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    /// Snapshot of the call in progress
    pub async fn current_call(&self) -> Option<CallInfo> {
        let phase = self.phase.lock().await;
        let state = phase.state();
        match &*phase {
            Phase::Idle => None,
            Phase::Outgoing(p) | Phase::Incoming(p) | Phase::Answering(p) => Some(CallInfo {
                call_id: p.call_id,
                state,
                room: p.room.clone(),
                is_video: p.is_video,
                participants: vec![p.counterparty.clone()],
                duration_secs: 0,
            }),
            Phase::Connected(s) => Some(CallInfo {
                call_id: s.call_id,
                state,
                room: s.room.clone(),
                is_video: s.is_video,
                participants: s.participants().to_vec(),
                duration_secs: s.duration_secs(),
            }),
        }
    }

    /// Grid for the connected peers (1×1 outside a session)
    pub async fn grid_layout(&self) -> GridLayout {
        match &*self.phase.lock().await {
            Phase::Connected(session) => session.grid_layout(),
            _ => grid_layout(0),
        }
    }

    /// Peers with a live link
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.connected_peers()
    }

    /// Flip the microphone; `None` without an audio track
    pub async fn toggle_mute(&self) -> Option<bool> {
        self.peers.toggle_mute().await
    }

    /// Flip the camera; `None` without a video track
    pub async fn toggle_camera(&self) -> Option<bool> {
        self.peers.toggle_camera().await
    }

    /// Place a 1:1 call
    ///
    /// The room is `explicit_room` when given, otherwise derived from the two
    /// user ids.
    ///
    /// # Errors
    ///
    /// Returns error if not idle, media is unavailable, or the initiate
    /// message cannot be sent. The controller is idle afterwards in every
    /// error case.
    #[tracing::instrument(skip(self, callee), fields(callee = %callee.id))]
    pub async fn initiate(
        &self,
        callee: Participant,
        is_video: bool,
        explicit_room: Option<RoomId>,
    ) -> Result<CallId, CallError> {
        let room = resolve_room(&self.local.id, &callee.id, explicit_room.as_ref());
        let message = SignalingMessage::Initiate(InitiatePayload {
            room: room.clone(),
            is_video,
            caller: self.local.clone(),
            is_group_call: false,
            to: Some(callee.id.clone()),
        });
        self.place_call(callee, room, is_video, false, message).await
    }

    /// Place a group call in `room`
    ///
    /// Every member that accepts joins the session.
    ///
    /// # Errors
    ///
    /// Returns error if `participants` is empty, not idle, media is
    /// unavailable, or the message cannot be sent.
    #[tracing::instrument(skip(self, participants), fields(room = %room, invited = participants.len()))]
    pub async fn initiate_group(
        &self,
        room: RoomId,
        participants: Vec<Participant>,
        is_video: bool,
    ) -> Result<CallId, CallError> {
        let first = participants
            .into_iter()
            .next()
            .ok_or(CallError::NoParticipants)?;
        let message = SignalingMessage::Initiate(InitiatePayload {
            room: room.clone(),
            is_video,
            caller: self.local.clone(),
            is_group_call: true,
            to: None,
        });
        self.place_call(first, room, is_video, true, message).await
    }

    async fn place_call(
        &self,
        counterparty: Participant,
        room: RoomId,
        is_video: bool,
        is_group: bool,
        message: SignalingMessage,
    ) -> Result<CallId, CallError> {
        let mut phase = self.phase.lock().await;
        if !matches!(*phase, Phase::Idle) {
            return Err(CallError::InvalidState {
                expected: "Idle",
                actual: phase.state(),
            });
        }

        if let Err(e) = self.peers.acquire_media(is_video).await {
            self.emit(CallEvent::MediaAccessFailed {
                reason: e.to_string(),
            });
            return Err(e.into());
        }

        let sent = async {
            self.join_call_room(&room).await?;
            self.signaling.send(&message).await
        };
        if let Err(e) = sent.await {
            tracing::warn!(room = %room, error = %e, "Failed to send call:initiate");
            self.peers.cleanup().await;
            self.leave_call_room().await;
            return Err(e.into());
        }

        let pending = PendingCall {
            call_id: CallId::new(),
            direction: CallDirection::Outgoing,
            is_video,
            counterparty: counterparty.clone(),
            room: room.clone(),
            is_group,
            remote_peer_id: None,
        };
        let call_id = pending.call_id;
        self.transition(&mut phase, Phase::Outgoing(pending));
        self.arm_ring_timer(call_id);

        tracing::info!(call_id = %call_id, room = %room, is_video, is_group, "Outgoing call placed");
        self.emit(CallEvent::OutgoingCall {
            call_id,
            callee: counterparty,
            room,
            is_video,
        });
        Ok(call_id)
    }

    /// Accept the ringing incoming call
    ///
    /// Media is acquired and the transport identifier awaited before
    /// `call:answer` is emitted. If either fails the call is declined with a
    /// reason and the controller returns to idle.
    ///
    /// # Errors
    ///
    /// Returns error if no call is ringing, or on media/transport/signaling
    /// failure.
    #[tracing::instrument(skip(self))]
    pub async fn answer(&self) -> Result<(), CallError> {
        let pending = {
            let mut phase = self.phase.lock().await;
            let Phase::Incoming(pending) = &*phase else {
                return Err(CallError::InvalidState {
                    expected: "Incoming",
                    actual: phase.state(),
                });
            };
            let pending = pending.clone();
            self.transition(&mut phase, Phase::Answering(pending.clone()));
            pending
        };

        let stream = match self.peers.acquire_media(pending.is_video).await {
            Ok(stream) => stream,
            Err(e) => {
                self.emit(CallEvent::MediaAccessFailed {
                    reason: e.to_string(),
                });
                self.abandon_answer(&pending, None, REASON_MEDIA_UNAVAILABLE)
                    .await;
                return Err(e.into());
            }
        };

        let local_peer_id = match self
            .peers
            .wait_for_identity(self.config.identity_timeout)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(call_id = %pending.call_id, error = %e, "No transport identity for answer");
                self.abandon_answer(&pending, Some(&stream), REASON_PEER_UNAVAILABLE)
                    .await;
                return Err(e.into());
            }
        };

        let room = resolve_room(&self.local.id, &pending.counterparty.id, Some(&pending.room));
        let mut phase = self.phase.lock().await;
        match &*phase {
            Phase::Answering(current) if current.call_id == pending.call_id => {}
            other => {
                let actual = other.state();
                drop(phase);
                self.release_stale_answer(&pending, Some(&stream)).await;
                return Err(CallError::InvalidState {
                    expected: "Incoming",
                    actual,
                });
            }
        }

        let message = SignalingMessage::Answer(AnswerPayload {
            room: room.clone(),
            to: pending.counterparty.id.clone(),
            peer_id: Some(local_peer_id),
            responder: self.local.clone(),
        });
        if let Err(e) = self.signaling.send(&message).await {
            tracing::warn!(call_id = %pending.call_id, error = %e, "Failed to send call:answer");
            self.go_idle(&mut phase).await;
            drop(phase);
            self.peers.cleanup().await;
            return Err(e.into());
        }

        let session = ActiveCallSession::start(
            pending.call_id,
            room,
            pending.is_video,
            CallDirection::Incoming,
            pending.counterparty.id.clone(),
            pending.is_group,
            pending.counterparty.clone(),
        );
        self.transition(&mut phase, Phase::Connected(session));
        tracing::info!(call_id = %pending.call_id, "Call answered");
        self.emit(CallEvent::CallConnected {
            call_id: pending.call_id,
            participants: vec![pending.counterparty.clone()],
            is_video: pending.is_video,
        });
        drop(phase);

        if let Some(remote) = &pending.remote_peer_id {
            self.connect_peer(remote).await;
        }
        Ok(())
    }

    async fn abandon_answer(
        &self,
        pending: &PendingCall,
        stream: Option<&Arc<LocalStream>>,
        reason: &str,
    ) {
        let mut phase = self.phase.lock().await;
        let still_answering =
            matches!(&*phase, Phase::Answering(current) if current.call_id == pending.call_id);
        if !still_answering {
            drop(phase);
            self.release_stale_answer(pending, stream).await;
            return;
        }
        self.go_idle(&mut phase).await;
        drop(phase);

        if let Err(e) = self.decline(pending, Some(reason)).await {
            tracing::warn!(call_id = %pending.call_id, error = %e, "Failed to send call:reject");
        }
    }

    /// The call this answer was for already ended and released its links
    ///
    /// Only the stream the answer captured is stopped, and only while it is
    /// still the current one; a newer call may own the media by now.
    async fn release_stale_answer(&self, pending: &PendingCall, stream: Option<&Arc<LocalStream>>) {
        tracing::info!(call_id = %pending.call_id, "Call went away while answering");
        if let Some(stream) = stream {
            self.peers.release_media(stream).await;
        }
    }

    /// Release everything, emit `call:reject` and report the declined call
    async fn decline(
        &self,
        pending: &PendingCall,
        reason: Option<&str>,
    ) -> Result<CallSummary, CallError> {
        self.peers.cleanup().await;
        let sent = self
            .signaling
            .send(&self.reject_message(pending, reason))
            .await;

        tracing::info!(call_id = %pending.call_id, reason = ?reason, "Call declined");
        let summary = self.pending_summary(pending, CallStatus::Cancelled);
        self.emit(CallEvent::CallEnded {
            summary: summary.clone(),
            reason: EndReason::Local,
        });
        sent.map(|()| summary).map_err(Into::into)
    }

    /// Decline the ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns error if no call is ringing, or if `call:reject` could not be
    /// sent (the controller is idle regardless).
    #[tracing::instrument(skip(self))]
    pub async fn reject(&self) -> Result<(), CallError> {
        let mut phase = self.phase.lock().await;
        let Phase::Incoming(pending) = &*phase else {
            return Err(CallError::InvalidState {
                expected: "Incoming",
                actual: phase.state(),
            });
        };
        let pending = pending.clone();
        self.go_idle(&mut phase).await;
        drop(phase);

        self.decline(&pending, None).await.map(|_| ())
    }

    /// Hang up, cancel or decline whatever is in progress
    ///
    /// Connected and outgoing calls emit `call:end`; a ringing incoming call
    /// is declined. Returns the summary, or `None` if already idle.
    ///
    /// # Errors
    ///
    /// Only returns error when declining a ringing call fails to send.
    #[tracing::instrument(skip(self))]
    pub async fn end(&self) -> Result<Option<CallSummary>, CallError> {
        let mut phase = self.phase.lock().await;
        let pending = match &*phase {
            Phase::Idle => return Ok(None),
            Phase::Incoming(pending) | Phase::Answering(pending) => pending.clone(),
            Phase::Outgoing(_) | Phase::Connected(_) => {
                return Ok(self.terminate(&mut phase, EndReason::Local).await);
            }
        };
        // A pending answer() notices the call is gone and returns
        self.go_idle(&mut phase).await;
        drop(phase);

        self.decline(&pending, None).await.map(Some)
    }

    /// Cancel an unanswered outgoing call; same as [`end`](Self::end)
    ///
    /// # Errors
    ///
    /// See [`end`](Self::end).
    pub async fn cancel(&self) -> Result<Option<CallSummary>, CallError> {
        self.end().await
    }

    /// Tear down an Outgoing or Connected call
    ///
    /// `call:end` is emitted only for local terminations and timeouts.
    async fn terminate(&self, phase: &mut Phase, reason: EndReason) -> Option<CallSummary> {
        let summary = match &*phase {
            Phase::Outgoing(pending) => {
                self.pending_summary(pending, CallStatus::derive(false, pending.direction))
            }
            Phase::Connected(session) => self.session_summary(session),
            _ => return None,
        };
        if reason != EndReason::Remote {
            let message = SignalingMessage::End(EndPayload {
                room: summary.room.clone(),
                duration: summary.duration_secs,
                status: summary.status,
                caller_id: summary.caller_id.clone(),
                participants: summary.participants.clone(),
                call_type: summary.call_type,
            });
            if let Err(e) = self.signaling.send(&message).await {
                tracing::warn!(call_id = %summary.call_id, error = %e, "Failed to send call:end");
            }
        }
        self.peers.cleanup().await;
        if let Phase::Connected(session) = self.go_idle(phase).await {
            self.finish_recording(session).await;
        }

        tracing::info!(
            call_id = %summary.call_id,
            duration = summary.duration_secs,
            status = ?summary.status,
            reason = ?reason,
            "Call ended"
        );
        self.emit(CallEvent::CallEnded {
            summary: summary.clone(),
            reason,
        });
        Some(summary)
    }

    /// Start recording the first connected peer
    ///
    /// # Errors
    ///
    /// Returns error without a session, without a remote stream, or if a
    /// recording is already running.
    pub async fn start_recording(&self) -> Result<PeerId, CallError> {
        let mut phase = self.phase.lock().await;
        let Phase::Connected(session) = &mut *phase else {
            return Err(CallError::NoActiveSession);
        };
        if session.is_recording() {
            return Err(CallError::Recording("already recording".to_string()));
        }
        let (peer, stream) = session
            .peers()
            .iter()
            .find_map(|peer| self.peers.remote_stream(peer).map(|s| (peer.clone(), s)))
            .ok_or_else(|| CallError::Recording("no remote stream to record".to_string()))?;

        session.start_recording(&stream);
        self.emit(CallEvent::RecordingStarted {
            call_id: session.call_id,
            peer: peer.clone(),
        });
        Ok(peer)
    }

    /// Stop the running recording and return its artifact
    ///
    /// # Errors
    ///
    /// Returns error without a session or a running recording.
    pub async fn stop_recording(&self) -> Result<RecordingArtifact, CallError> {
        let mut phase = self.phase.lock().await;
        let Phase::Connected(session) = &mut *phase else {
            return Err(CallError::NoActiveSession);
        };
        let recorder = session
            .take_recorder()
            .ok_or_else(|| CallError::Recording("not recording".to_string()))?;
        drop(phase);

        let artifact = recorder
            .stop()
            .await
            .map_err(|e| CallError::Recording(e.to_string()))?;
        self.emit(CallEvent::RecordingFinished {
            artifact: artifact.clone(),
        });
        Ok(artifact)
    }

    /// Whether a recording is running
    pub async fn is_recording(&self) -> bool {
        matches!(&*self.phase.lock().await, Phase::Connected(s) if s.is_recording())
    }

    /// Apply an inbound signaling message
    pub async fn handle_message(&self, message: SignalingMessage) {
        tracing::debug!(event = message.event_name(), "Handling signaling message");
        match message {
            SignalingMessage::Incoming(payload) => self.on_incoming(payload).await,
            SignalingMessage::Accepted(payload) => self.on_accepted(payload).await,
            SignalingMessage::Rejected(payload) => self.on_rejected(payload).await,
            SignalingMessage::Failed(payload) => self.on_failed(payload.reason, payload.room).await,
            SignalingMessage::Ended(payload) => self.on_ended(payload).await,
            other => {
                tracing::debug!(event = other.event_name(), "Ignoring client-originated message");
            }
        }
    }

    /// Apply a peer link event to the session
    pub async fn handle_peer_event(&self, event: PeerEvent) {
        let mut phase = self.phase.lock().await;
        let Phase::Connected(session) = &mut *phase else {
            return;
        };
        match event {
            PeerEvent::PeerConnected { peer } => {
                if session.add_peer(peer.clone()) {
                    tracing::debug!(call_id = %session.call_id, peer = %peer, "Peer joined session");
                }
            }
            PeerEvent::PeerDisconnected { peer, reason } => {
                let removed = session.remove_peer(&peer);
                tracing::debug!(call_id = %session.call_id, peer = %peer, reason = ?reason, "Peer left session");
                if removed && !session.is_group && session.peers().is_empty() {
                    let end_reason = if reason.is_some() {
                        EndReason::PeerLost
                    } else {
                        EndReason::Remote
                    };
                    tracing::info!(call_id = %session.call_id, "Only peer is gone");
                    self.terminate(&mut phase, end_reason).await;
                }
            }
            _ => {}
        }
    }

    async fn on_incoming(&self, payload: IncomingPayload) {
        if payload.caller.id == self.local.id {
            tracing::debug!("Ignoring our own call");
            return;
        }

        let mut phase = self.phase.lock().await;
        if !matches!(*phase, Phase::Idle) {
            let reply = self.config.busy_policy == BusyPolicy::Reject;
            tracing::info!(
                caller = %payload.caller.id,
                state = ?phase.state(),
                replied_busy = reply,
                "Incoming call while busy"
            );
            drop(phase);
            if reply {
                let message = SignalingMessage::Reject(RejectPayload {
                    room: payload.room_id.clone(),
                    to: payload.caller.id.clone(),
                    rejecter_id: self.local.id.clone(),
                    caller_id: payload.caller.id.clone(),
                    call_type: CallType::from_video(payload.is_video),
                    reason: Some(REASON_BUSY.to_string()),
                });
                if let Err(e) = self.signaling.send(&message).await {
                    tracing::warn!(error = %e, "Failed to send busy reject");
                }
            }
            self.emit(CallEvent::IncomingCallIgnored {
                caller: payload.caller,
                replied_busy: reply,
            });
            return;
        }

        if let Err(e) = self.join_call_room(&payload.room_id).await {
            tracing::warn!(room = %payload.room_id, error = %e, "Failed to join call room");
        }

        let pending = PendingCall {
            call_id: CallId::new(),
            direction: CallDirection::Incoming,
            is_video: payload.is_video,
            counterparty: payload.caller.clone(),
            room: payload.room_id.clone(),
            is_group: false,
            remote_peer_id: payload.peer_id,
        };
        let call_id = pending.call_id;
        self.transition(&mut phase, Phase::Incoming(pending));
        self.arm_ring_timer(call_id);

        tracing::info!(call_id = %call_id, caller = %payload.caller.id, "Incoming call");
        self.emit(CallEvent::IncomingCall {
            call_id,
            caller: payload.caller,
            room: payload.room_id,
            is_video: payload.is_video,
        });
    }

    async fn on_accepted(&self, payload: AcceptedPayload) {
        let mut phase = self.phase.lock().await;
        if !self.concerns(&phase, payload.room.as_ref()) {
            return;
        }

        match &mut *phase {
            Phase::Outgoing(pending) => {
                let pending = pending.clone();
                let session = ActiveCallSession::start(
                    pending.call_id,
                    pending.room.clone(),
                    pending.is_video,
                    CallDirection::Outgoing,
                    self.local.id.clone(),
                    pending.is_group,
                    payload.responder.clone(),
                );
                self.transition(&mut phase, Phase::Connected(session));
                drop(phase);

                tracing::info!(call_id = %pending.call_id, responder = %payload.responder.id, "Call accepted");
                self.emit(CallEvent::CallConnected {
                    call_id: pending.call_id,
                    participants: vec![payload.responder],
                    is_video: pending.is_video,
                });
            }
            Phase::Connected(session) if session.is_group => {
                let call_id = session.call_id;
                let joined = session.add_participant(payload.responder.clone());
                drop(phase);
                if joined {
                    tracing::info!(call_id = %call_id, participant = %payload.responder.id, "Participant joined");
                    self.emit(CallEvent::ParticipantJoined {
                        call_id,
                        participant: payload.responder,
                    });
                }
            }
            other => {
                tracing::debug!(state = ?other.state(), "Ignoring call:accepted");
                return;
            }
        }

        match payload.peer_id {
            Some(peer) => self.connect_peer(&peer).await,
            None => tracing::warn!("call:accepted without a transport identifier"),
        }
    }

    async fn on_rejected(&self, payload: RoutingPayload) {
        let mut phase = self.phase.lock().await;
        if !self.concerns(&phase, payload.room.as_ref()) {
            return;
        }
        let pending = match &*phase {
            Phase::Outgoing(pending) if !pending.is_group => pending,
            Phase::Outgoing(_) => {
                tracing::debug!("Group member declined, still ringing");
                return;
            }
            other => {
                tracing::debug!(state = ?other.state(), "Ignoring call:rejected");
                return;
            }
        };
        let pending = pending.clone();
        self.go_idle(&mut phase).await;
        drop(phase);

        self.peers.cleanup().await;
        let notice = match payload.reason.as_deref() {
            Some(REASON_BUSY) => format!("{} is busy", pending.counterparty.username),
            _ => format!("{} declined the call", pending.counterparty.username),
        };
        tracing::info!(call_id = %pending.call_id, reason = ?payload.reason, "Call rejected by remote");
        self.emit(CallEvent::CallRejected {
            summary: self.pending_summary(&pending, CallStatus::Cancelled),
            notice,
        });
    }

    async fn on_failed(&self, reason: String, room: Option<RoomId>) {
        let mut phase = self.phase.lock().await;
        if !self.concerns(&phase, room.as_ref()) {
            return;
        }
        let Phase::Outgoing(pending) = &*phase else {
            tracing::debug!(state = ?phase.state(), "Ignoring call:failed");
            return;
        };
        let call_id = pending.call_id;
        self.go_idle(&mut phase).await;
        drop(phase);

        self.peers.cleanup().await;
        tracing::warn!(call_id = %call_id, reason = %reason, "Call failed");
        self.emit(CallEvent::CallFailed { call_id, reason });
    }

    async fn on_ended(&self, payload: RoutingPayload) {
        let mut phase = self.phase.lock().await;
        if !self.concerns(&phase, payload.room.as_ref()) {
            return;
        }
        match &*phase {
            Phase::Incoming(pending) | Phase::Answering(pending) => {
                let pending = pending.clone();
                self.go_idle(&mut phase).await;
                drop(phase);
                self.peers.cleanup().await;
                tracing::info!(call_id = %pending.call_id, "Caller hung up before answer");
                self.emit(CallEvent::CallEnded {
                    summary: self.pending_summary(&pending, CallStatus::Missed),
                    reason: EndReason::Remote,
                });
            }
            Phase::Outgoing(_) | Phase::Connected(_) => {
                self.terminate(&mut phase, EndReason::Remote).await;
            }
            Phase::Idle => tracing::debug!("Ignoring call:ended while idle"),
        }
    }

    async fn ring_expired(&self, call_id: CallId) {
        let mut phase = self.phase.lock().await;
        match &*phase {
            Phase::Outgoing(p) if p.call_id == call_id => {
                tracing::info!(call_id = %call_id, "Outgoing call unanswered");
                self.terminate(&mut phase, EndReason::Timeout).await;
            }
            Phase::Incoming(p) if p.call_id == call_id => {
                let pending = p.clone();
                self.go_idle(&mut phase).await;
                drop(phase);
                self.peers.cleanup().await;
                tracing::info!(call_id = %call_id, "Incoming call unanswered");
                self.emit(CallEvent::CallEnded {
                    summary: self.pending_summary(&pending, CallStatus::Missed),
                    reason: EndReason::Timeout,
                });
            }
            _ => {}
        }
    }

    fn arm_ring_timer(&self, call_id: CallId) {
        let Some(timeout) = self.config.ring_timeout else {
            return;
        };
        let this = self.this.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(controller) = this.upgrade() {
                // Detach so the transition below does not abort this task
                controller.ring_timer.lock().take();
                controller.ring_expired(call_id).await;
            }
        });
        if let Some(previous) = self.ring_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Join `room` for the current call, remembering it if it was not joined
    /// before so it can be left again
    async fn join_call_room(&self, room: &RoomId) -> Result<(), SignalingError> {
        if self.signaling.join_room(room).await? {
            *self.call_room.lock() = Some(room.clone());
        }
        Ok(())
    }

    async fn leave_call_room(&self) {
        let Some(room) = self.call_room.lock().take() else {
            return;
        };
        if let Err(e) = self.signaling.leave_room(&room).await {
            tracing::debug!(room = %room, error = %e, "Failed to leave call room");
        }
    }

    /// Return to idle while the phase lock is held, leaving the call room
    async fn go_idle(&self, phase: &mut Phase) -> Phase {
        let previous = self.transition(phase, Phase::Idle);
        self.leave_call_room().await;
        previous
    }

    async fn connect_peer(&self, peer: &PeerId) {
        if let Err(e) = self.peers.connect(peer).await {
            tracing::warn!(peer = %peer, error = %e, "Failed to connect to peer");
        }
    }

    async fn finish_recording(&self, mut session: ActiveCallSession) {
        let Some(recorder) = session.take_recorder() else {
            return;
        };
        match recorder.stop().await {
            Ok(artifact) => self.emit(CallEvent::RecordingFinished { artifact }),
            Err(e) => tracing::warn!(call_id = %session.call_id, error = %e, "Recording lost"),
        }
    }

    /// Whether a message scoped to `room` belongs to the current call
    fn concerns(&self, phase: &Phase, room: Option<&RoomId>) -> bool {
        match (phase.room(), room) {
            (Some(current), Some(room)) if current != room => {
                tracing::debug!(current = %current, room = %room, "Ignoring message for another room");
                false
            }
            _ => true,
        }
    }

    /// Replace the phase, returning the previous one
    fn transition(&self, phase: &mut Phase, next: Phase) -> Phase {
        let old_state = phase.state();
        let previous = std::mem::replace(phase, next);
        if !phase.is_ringing() {
            if let Some(timer) = self.ring_timer.lock().take() {
                timer.abort();
            }
        }
        let new_state = phase.state();
        if old_state != new_state {
            tracing::debug!(old_state = ?old_state, new_state = ?new_state, "Call state transition");
            self.state.send_replace(new_state);
        }
        previous
    }

    fn reject_message(&self, pending: &PendingCall, reason: Option<&str>) -> SignalingMessage {
        SignalingMessage::Reject(RejectPayload {
            room: pending.room.clone(),
            to: pending.counterparty.id.clone(),
            rejecter_id: self.local.id.clone(),
            caller_id: pending.counterparty.id.clone(),
            call_type: CallType::from_video(pending.is_video),
            reason: reason.map(str::to_string),
        })
    }

    fn pending_summary(&self, pending: &PendingCall, status: CallStatus) -> CallSummary {
        let (caller_id, other) = match pending.direction {
            CallDirection::Outgoing => (self.local.id.clone(), pending.counterparty.id.clone()),
            CallDirection::Incoming => (pending.counterparty.id.clone(), self.local.id.clone()),
        };
        CallSummary {
            call_id: pending.call_id,
            room: pending.room.clone(),
            call_type: CallType::from_video(pending.is_video),
            participants: vec![caller_id.clone(), other],
            caller_id,
            duration_secs: 0,
            status,
            ended_at: Utc::now(),
        }
    }

    fn session_summary(&self, session: &ActiveCallSession) -> CallSummary {
        CallSummary {
            call_id: session.call_id,
            room: session.room.clone(),
            call_type: CallType::from_video(session.is_video),
            caller_id: session.caller_id.clone(),
            participants: session.participant_ids(&self.local.id),
            duration_secs: session.duration_secs(),
            status: CallStatus::derive(true, session.direction),
            ended_at: Utc::now(),
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_sender.send(event);
    }
}

impl<C: EventChannel + 'static> Drop for CallController<C> {
    fn drop(&mut self) {
        if let Some(timer) = self.ring_timer.lock().take() {
            timer.abort();
        }
    }
}

#[cfg(all(test, feature = "loopback"))]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackChannel, LoopbackHub, LoopbackPeerNetwork, SyntheticDevices};
    use crate::media::MediaAcquisition;

    async fn controller(hub: &LoopbackHub) -> Arc<CallController<LoopbackChannel>> {
        let local = Participant::new("u1", "alice");
        let signaling = Arc::new(SignalingClient::new(
            Arc::new(hub.channel()),
            local.id.clone(),
            crate::config::ReconnectPolicy::never(),
        ));
        signaling.connect().await.unwrap();
        let media = MediaAcquisition::new(
            Arc::new(SyntheticDevices::new()),
            crate::config::CaptureSettings::default(),
        );
        let peers = Arc::new(PeerLinkManager::new(
            Arc::new(LoopbackPeerNetwork::new().transport()),
            media,
        ));
        CallController::new(local, signaling, peers, CallConfig::default())
    }

    #[tokio::test]
    async fn test_idle_operations() {
        let hub = LoopbackHub::new();
        let controller = controller(&hub).await;

        assert_eq!(controller.state(), CallState::Idle);
        assert!(controller.end().await.unwrap().is_none());
        assert!(controller.current_call().await.is_none());
        assert!(matches!(
            controller.answer().await,
            Err(CallError::InvalidState { expected: "Incoming", actual: CallState::Idle })
        ));
        assert!(matches!(
            controller.reject().await,
            Err(CallError::InvalidState { .. })
        ));
        assert!(matches!(
            controller.start_recording().await,
            Err(CallError::NoActiveSession)
        ));
        assert!(matches!(
            controller
                .initiate_group(RoomId::new("team"), Vec::new(), false)
                .await,
            Err(CallError::NoParticipants)
        ));
    }

    #[tokio::test]
    async fn test_initiate_requires_idle() {
        let hub = LoopbackHub::new();
        let controller = controller(&hub).await;
        let mut events = controller.subscribe_events();

        let bob = Participant::new("u2", "bob");
        let call_id = controller.initiate(bob.clone(), false, None).await.unwrap();
        assert_eq!(controller.state(), CallState::Outgoing);
        assert!(matches!(
            events.recv().await.unwrap(),
            CallEvent::OutgoingCall { call_id: id, .. } if id == call_id
        ));
        assert!(matches!(
            controller.initiate(bob, false, None).await,
            Err(CallError::InvalidState { actual: CallState::Outgoing, .. })
        ));

        let info = controller.current_call().await.unwrap();
        assert_eq!(info.room, RoomId::new("u1_u2"));
        assert_eq!(info.duration_secs, 0);
    }

    #[tokio::test]
    async fn test_own_incoming_call_is_ignored() {
        let hub = LoopbackHub::new();
        let controller = controller(&hub).await;

        controller
            .handle_message(SignalingMessage::Incoming(IncomingPayload {
                caller: Participant::new("u1", "alice"),
                is_video: false,
                room_id: RoomId::new("u1_u2"),
                peer_id: None,
            }))
            .await;
        assert_eq!(controller.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_remote_end_while_ringing_is_missed() {
        let hub = LoopbackHub::new();
        let controller = controller(&hub).await;
        let mut events = controller.subscribe_events();

        controller
            .handle_message(SignalingMessage::Incoming(IncomingPayload {
                caller: Participant::new("u2", "bob"),
                is_video: true,
                room_id: RoomId::new("u1_u2"),
                peer_id: None,
            }))
            .await;
        assert_eq!(controller.state(), CallState::Incoming);

        controller
            .handle_message(SignalingMessage::Ended(RoutingPayload {
                room: Some(RoomId::new("u1_u2")),
                reason: None,
            }))
            .await;
        assert_eq!(controller.state(), CallState::Idle);

        let _incoming = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            CallEvent::CallEnded { summary, reason } => {
                assert_eq!(reason, EndReason::Remote);
                assert_eq!(summary.status, CallStatus::Missed);
                assert_eq!(summary.caller_id.as_str(), "u2");
                assert_eq!(summary.call_type, CallType::Video);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
