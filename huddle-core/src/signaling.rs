//! Call signaling protocol
//!
//! Call setup messages travel over the always-on event channel the chat client
//! keeps with its server. This module defines:
//!
//! - [`SignalingMessage`], one variant per wire event, validated at the
//!   boundary so malformed frames never reach the state machine;
//! - [`EventChannel`], the transport the chat server connection provides;
//! - [`SignalingClient`], an owned client over an [`EventChannel`] with an
//!   explicit connect/disconnect lifecycle and a reconnection policy.

use crate::config::ReconnectPolicy;
use crate::identity::{Participant, PeerId, UserId};
use crate::types::{CallStatus, CallType, RoomId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;

/// Maximum signaling frame size (64KB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Frame could not be parsed
    #[error("Malformed signaling frame: {0}")]
    Malformed(String),

    /// Frame parsed but violates the payload contract
    #[error("Invalid {event} payload: {reason}")]
    Invalid {
        /// Wire event name
        event: &'static str,
        /// What is wrong
        reason: String,
    },

    /// Frame exceeds [`MAX_FRAME_SIZE`]
    #[error("Signaling frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Client is not connected
    #[error("Signaling client is not connected")]
    NotConnected,

    /// Underlying channel failed
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Event channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The connection is closed
    #[error("Channel closed")]
    Closed,

    /// The server refused the operation
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// IO failure
    #[error("IO error: {0}")]
    Io(String),
}

/// `call:initiate` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePayload {
    /// Signaling room
    pub room: RoomId,
    /// Video flag
    pub is_video: bool,
    /// Caller profile
    pub caller: Participant,
    /// Group call flag
    pub is_group_call: bool,
    /// Callee for 1:1 calls; group calls route by room membership
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<UserId>,
}

/// `call:incoming` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingPayload {
    /// Caller profile
    pub caller: Participant,
    /// Video flag
    pub is_video: bool,
    /// Signaling room
    pub room_id: RoomId,
    /// Caller transport identifier, when the caller already published it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
}

/// `call:answer` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    /// Signaling room
    pub room: RoomId,
    /// The caller
    pub to: UserId,
    /// Responder transport identifier
    pub peer_id: Option<PeerId>,
    /// Responder profile
    pub responder: Participant,
}

/// `call:accepted` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedPayload {
    /// Responder profile
    pub responder: Participant,
    /// Responder transport identifier
    pub peer_id: Option<PeerId>,
    /// Signaling room, when the server forwards it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
}

/// `call:reject` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectPayload {
    /// Signaling room
    pub room: RoomId,
    /// The caller
    pub to: UserId,
    /// Who declined
    pub rejecter_id: UserId,
    /// Who called
    pub caller_id: UserId,
    /// Audio or video
    #[serde(rename = "type")]
    pub call_type: CallType,
    /// Machine-readable reason (`busy`, `media-unavailable`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `call:end` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndPayload {
    /// Signaling room
    pub room: RoomId,
    /// Whole seconds
    pub duration: u64,
    /// Terminal status
    pub status: CallStatus,
    /// Who placed the call
    pub caller_id: UserId,
    /// Everyone involved
    pub participants: Vec<UserId>,
    /// Audio or video
    #[serde(rename = "type")]
    pub call_type: CallType,
}

/// Routing-only payload of `call:rejected` and `call:ended`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingPayload {
    /// Room the event belongs to, when forwarded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
    /// Reason forwarded from the remote side
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `call:failed` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPayload {
    /// Why the call could not be placed
    pub reason: String,
    /// Room of the failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
}

/// Signaling message types
///
/// Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SignalingMessage {
    /// Caller → server: place a call
    #[serde(rename = "call:initiate")]
    Initiate(InitiatePayload),
    /// Server → callee: someone is calling
    #[serde(rename = "call:incoming")]
    Incoming(IncomingPayload),
    /// Callee → server: accept
    #[serde(rename = "call:answer")]
    Answer(AnswerPayload),
    /// Server → caller: callee accepted
    #[serde(rename = "call:accepted")]
    Accepted(AcceptedPayload),
    /// Callee → server: decline
    #[serde(rename = "call:reject")]
    Reject(RejectPayload),
    /// Server → caller: callee declined
    #[serde(rename = "call:rejected")]
    Rejected(RoutingPayload),
    /// Either side → server: hang up
    #[serde(rename = "call:end")]
    End(EndPayload),
    /// Server → other party: call was hung up
    #[serde(rename = "call:ended")]
    Ended(RoutingPayload),
    /// Server → caller: call could not be placed
    #[serde(rename = "call:failed")]
    Failed(FailedPayload),
}

impl SignalingMessage {
    /// Wire event name
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Initiate(_) => "call:initiate",
            Self::Incoming(_) => "call:incoming",
            Self::Answer(_) => "call:answer",
            Self::Accepted(_) => "call:accepted",
            Self::Reject(_) => "call:reject",
            Self::Rejected(_) => "call:rejected",
            Self::End(_) => "call:end",
            Self::Ended(_) => "call:ended",
            Self::Failed(_) => "call:failed",
        }
    }

    /// Room the message refers to, when it carries one
    #[must_use]
    pub fn room(&self) -> Option<&RoomId> {
        match self {
            Self::Initiate(p) => Some(&p.room),
            Self::Incoming(p) => Some(&p.room_id),
            Self::Answer(p) => Some(&p.room),
            Self::Accepted(p) => p.room.as_ref(),
            Self::Reject(p) => Some(&p.room),
            Self::Rejected(p) | Self::Ended(p) => p.room.as_ref(),
            Self::End(p) => Some(&p.room),
            Self::Failed(p) => p.room.as_ref(),
        }
    }

    /// Whether the client sends this message (as opposed to receiving it)
    #[must_use]
    pub fn is_client_originated(&self) -> bool {
        matches!(
            self,
            Self::Initiate(_) | Self::Answer(_) | Self::Reject(_) | Self::End(_)
        )
    }

    /// Check the payload contract
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), SignalingError> {
        let event = self.event_name();
        let invalid = |reason: &str| {
            Err(SignalingError::Invalid {
                event,
                reason: reason.to_string(),
            })
        };

        match self {
            Self::Initiate(p) => {
                if p.room.is_blank() {
                    return invalid("room is empty");
                }
                if p.caller.id.is_blank() {
                    return invalid("caller id is empty");
                }
                if p.to.as_ref().is_some_and(UserId::is_blank) {
                    return invalid("callee id is empty");
                }
            }
            Self::Incoming(p) => {
                if p.caller.id.is_blank() {
                    return invalid("caller id is empty");
                }
                if p.room_id.is_blank() {
                    return invalid("roomId is empty");
                }
                if p.peer_id.as_ref().is_some_and(PeerId::is_blank) {
                    return invalid("peerId is empty");
                }
            }
            Self::Answer(p) => {
                if p.room.is_blank() {
                    return invalid("room is empty");
                }
                if p.to.is_blank() {
                    return invalid("recipient id is empty");
                }
                if p.responder.id.is_blank() {
                    return invalid("responder id is empty");
                }
                if p.peer_id.as_ref().is_some_and(PeerId::is_blank) {
                    return invalid("peerId is empty");
                }
            }
            Self::Accepted(p) => {
                if p.responder.id.is_blank() {
                    return invalid("responder id is empty");
                }
                if p.peer_id.as_ref().is_some_and(PeerId::is_blank) {
                    return invalid("peerId is empty");
                }
            }
            Self::Reject(p) => {
                if p.room.is_blank() {
                    return invalid("room is empty");
                }
                if p.to.is_blank() || p.caller_id.is_blank() {
                    return invalid("caller id is empty");
                }
                if p.rejecter_id.is_blank() {
                    return invalid("rejecter id is empty");
                }
            }
            Self::End(p) => {
                if p.room.is_blank() {
                    return invalid("room is empty");
                }
                if p.caller_id.is_blank() {
                    return invalid("caller id is empty");
                }
                if p.participants.iter().any(UserId::is_blank) {
                    return invalid("participant id is empty");
                }
            }
            Self::Rejected(_) | Self::Ended(_) | Self::Failed(_) => {}
        }
        Ok(())
    }

    /// Serialize and validate for sending
    ///
    /// # Errors
    ///
    /// Returns error if the message is invalid or too large
    pub fn encode(&self) -> Result<String, SignalingError> {
        self.validate()?;
        let frame =
            serde_json::to_string(self).map_err(|e| SignalingError::Malformed(e.to_string()))?;
        if frame.len() > MAX_FRAME_SIZE {
            return Err(SignalingError::FrameTooLarge(frame.len()));
        }
        Ok(frame)
    }

    /// Parse and validate a received frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is too large, unparsable or invalid
    pub fn decode(frame: &str) -> Result<Self, SignalingError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(SignalingError::FrameTooLarge(frame.len()));
        }
        let message: Self =
            serde_json::from_str(frame).map_err(|e| SignalingError::Malformed(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}

/// Event channel to the chat server
///
/// Implement this for the real server connection (websocket, socket.io,
/// ...). Frames are JSON text; decoding and validation happen in
/// [`SignalingClient`].
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Open the connection as `user`
    async fn connect(&self, user: &UserId) -> Result<(), ChannelError>;

    /// Close the connection. Pending `next_frame` calls return [`ChannelError::Closed`].
    async fn disconnect(&self);

    /// Subscribe to events scoped to `room`
    async fn join_room(&self, room: &RoomId) -> Result<(), ChannelError>;

    /// Stop receiving events scoped to `room`
    async fn leave_room(&self, room: &RoomId) -> Result<(), ChannelError>;

    /// Send one frame
    async fn emit(&self, frame: String) -> Result<(), ChannelError>;

    /// Wait for the next inbound frame
    async fn next_frame(&self) -> Result<String, ChannelError>;
}

/// Lifecycle of the signaling client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected
    Disconnected,
    /// Connected and receiving
    Connected,
    /// Lost the channel, retrying
    Reconnecting,
    /// Explicitly disconnected
    Closed,
}

/// Owned signaling client
///
/// Replaces a process-wide socket: construct one per logged-in user and hand
/// it to the call controller.
pub struct SignalingClient<C: EventChannel> {
    channel: Arc<C>,
    user: UserId,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    rooms: Mutex<BTreeSet<RoomId>>,
    error_count: AtomicU32,
}

impl<C: EventChannel> SignalingClient<C> {
    /// Create a client; nothing is opened until [`connect`](Self::connect)
    #[must_use]
    pub fn new(channel: Arc<C>, user: UserId, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            channel,
            user,
            policy,
            state,
            rooms: Mutex::new(BTreeSet::new()),
            error_count: AtomicU32::new(0),
        }
    }

    /// Signed-in user
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Rooms joined so far
    #[must_use]
    pub fn joined_rooms(&self) -> Vec<RoomId> {
        self.rooms.lock().iter().cloned().collect()
    }

    /// Get access to the underlying channel
    #[must_use]
    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    /// Connect, retrying per the reconnection policy
    ///
    /// # Errors
    ///
    /// Returns the last channel error once attempts are exhausted
    #[tracing::instrument(skip(self), fields(user = %self.user))]
    pub async fn connect(&self) -> Result<(), SignalingError> {
        self.establish().await?;
        tracing::info!("Signaling connected");
        Ok(())
    }

    /// Close the channel; further receives fail with `NotConnected`
    #[tracing::instrument(skip(self), fields(user = %self.user))]
    pub async fn disconnect(&self) {
        self.state.send_replace(ConnectionState::Closed);
        self.channel.disconnect().await;
        tracing::info!("Signaling disconnected");
    }

    /// Join a room; remembered and re-joined after reconnects
    ///
    /// Returns `false` if the room was already joined. A refused join is not
    /// remembered, so it can be retried.
    ///
    /// # Errors
    ///
    /// Returns error if the channel refuses
    #[tracing::instrument(skip(self), fields(room = %room))]
    pub async fn join_room(&self, room: &RoomId) -> Result<bool, SignalingError> {
        if self.rooms.lock().contains(room) {
            return Ok(false);
        }
        self.channel.join_room(room).await?;
        let newly_joined = self.rooms.lock().insert(room.clone());
        tracing::debug!("Joined room");
        Ok(newly_joined)
    }

    /// Leave a room and stop re-joining it after reconnects
    ///
    /// Rooms that were never joined are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the channel fails to leave; the room is forgotten
    /// either way
    #[tracing::instrument(skip(self), fields(room = %room))]
    pub async fn leave_room(&self, room: &RoomId) -> Result<(), SignalingError> {
        if !self.rooms.lock().remove(room) {
            return Ok(());
        }
        if self.state() == ConnectionState::Connected {
            self.channel.leave_room(room).await?;
        }
        tracing::debug!("Left room");
        Ok(())
    }

    /// Validate, encode and send a message
    ///
    /// # Errors
    ///
    /// Returns error if not connected, the message is invalid, or the send fails
    #[tracing::instrument(skip(self, message), fields(event = message.event_name()))]
    pub async fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        if self.state() != ConnectionState::Connected {
            return Err(SignalingError::NotConnected);
        }
        let frame = message.encode()?;
        tracing::debug!(bytes = frame.len(), "Sending signaling message");
        self.channel.emit(frame).await?;
        Ok(())
    }

    /// Receive the next valid message
    ///
    /// Malformed frames are logged and skipped. A channel failure triggers a
    /// reconnect with backoff; if that is exhausted the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` after an explicit disconnect, or the channel
    /// error when reconnection gives up
    pub async fn recv(&self) -> Result<SignalingMessage, SignalingError> {
        loop {
            if matches!(
                self.state(),
                ConnectionState::Closed | ConnectionState::Disconnected
            ) {
                return Err(SignalingError::NotConnected);
            }

            match self.channel.next_frame().await {
                Ok(frame) => match SignalingMessage::decode(&frame) {
                    Ok(message) => {
                        self.error_count.store(0, Ordering::SeqCst);
                        tracing::debug!(event = message.event_name(), "Received signaling message");
                        return Ok(message);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping invalid signaling frame");
                    }
                },
                Err(e) => {
                    if self.state() == ConnectionState::Closed {
                        return Err(SignalingError::NotConnected);
                    }
                    let count = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::warn!(error = %e, error_count = count, "Signaling channel lost");
                    self.state.send_replace(ConnectionState::Reconnecting);
                    self.establish().await?;
                    tracing::info!("Signaling reconnected");
                }
            }
        }
    }

    async fn establish(&self) -> Result<(), SignalingError> {
        let mut attempt = 0u32;
        loop {
            match self.channel.connect(&self.user).await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    if attempt > self.policy.max_attempts {
                        tracing::error!(attempts = attempt, error = %e, "Giving up on signaling channel");
                        self.state.send_replace(ConnectionState::Disconnected);
                        return Err(SignalingError::Channel(e));
                    }
                    let backoff = self.policy.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        error = %e,
                        "Signaling connect failed, backing off"
                    );
                    sleep(backoff).await;
                }
            }
        }

        let rooms = self.joined_rooms();
        for room in &rooms {
            self.channel.join_room(room).await?;
        }
        if !rooms.is_empty() {
            tracing::debug!(rooms = rooms.len(), "Re-joined rooms");
        }
        self.state.send_replace(ConnectionState::Connected);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    // Mock channel for testing
    #[derive(Default)]
    struct MockChannel {
        inbound: Mutex<VecDeque<Result<String, ChannelError>>>,
        sent: Mutex<Vec<String>>,
        joins: Mutex<Vec<RoomId>>,
        leaves: Mutex<Vec<RoomId>>,
        join_failures: AtomicU32,
        connect_failures: AtomicU32,
        connects: AtomicU32,
    }

    #[async_trait]
    impl EventChannel for MockChannel {
        async fn connect(&self, _user: &UserId) -> Result<(), ChannelError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.connect_failures.load(Ordering::SeqCst) > 0 {
                self.connect_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ChannelError::Io("refused".to_string()));
            }
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn join_room(&self, room: &RoomId) -> Result<(), ChannelError> {
            if self.join_failures.load(Ordering::SeqCst) > 0 {
                self.join_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ChannelError::Rejected("room full".to_string()));
            }
            self.joins.lock().push(room.clone());
            Ok(())
        }

        async fn leave_room(&self, room: &RoomId) -> Result<(), ChannelError> {
            self.leaves.lock().push(room.clone());
            Ok(())
        }

        async fn emit(&self, frame: String) -> Result<(), ChannelError> {
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn next_frame(&self) -> Result<String, ChannelError> {
            self.inbound
                .lock()
                .pop_front()
                .unwrap_or(Err(ChannelError::Closed))
        }
    }

    fn alice() -> Participant {
        Participant::new("u1", "alice")
    }

    fn initiate() -> SignalingMessage {
        SignalingMessage::Initiate(InitiatePayload {
            room: RoomId::new("u1_u2"),
            is_video: true,
            caller: alice(),
            is_group_call: false,
            to: Some(UserId::new("u2")),
        })
    }

    #[test]
    fn test_wire_format() {
        let frame = initiate().encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "call:initiate");
        assert_eq!(value["data"]["room"], "u1_u2");
        assert_eq!(value["data"]["isVideo"], true);
        assert_eq!(value["data"]["isGroupCall"], false);
        assert_eq!(value["data"]["caller"]["username"], "alice");
    }

    #[test]
    fn test_end_payload_uses_type_key() {
        let end = SignalingMessage::End(EndPayload {
            room: RoomId::new("u1_u2"),
            duration: 42,
            status: CallStatus::Completed,
            caller_id: UserId::new("u1"),
            participants: vec![UserId::new("u1"), UserId::new("u2")],
            call_type: CallType::Video,
        });
        let value: serde_json::Value = serde_json::from_str(&end.encode().unwrap()).unwrap();
        assert_eq!(value["data"]["type"], "video");
        assert_eq!(value["data"]["status"], "completed");
        assert_eq!(value["data"]["duration"], 42);
        assert_eq!(value["data"]["callerId"], "u1");
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let frame = r#"{"event":"call:incoming","data":{"isVideo":true,"roomId":"r"}}"#;
        assert!(matches!(
            SignalingMessage::decode(frame),
            Err(SignalingError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_event() {
        let frame = r#"{"event":"call:teleport","data":{}}"#;
        assert!(matches!(
            SignalingMessage::decode(frame),
            Err(SignalingError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_blank_ids() {
        let frame = r#"{"event":"call:incoming","data":{"caller":{"id":"","username":"x"},"isVideo":false,"roomId":"r"}}"#;
        assert!(matches!(
            SignalingMessage::decode(frame),
            Err(SignalingError::Invalid { event: "call:incoming", .. })
        ));
    }

    #[test]
    fn test_routing_only_events_accept_empty_data() {
        let msg = SignalingMessage::decode(r#"{"event":"call:rejected","data":{}}"#).unwrap();
        assert_eq!(msg, SignalingMessage::Rejected(RoutingPayload::default()));
        assert!(msg.room().is_none());
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let frame = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            SignalingMessage::decode(&frame),
            Err(SignalingError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let channel = Arc::new(MockChannel::default());
        let client = SignalingClient::new(channel.clone(), UserId::new("u1"), ReconnectPolicy::default());

        assert!(matches!(
            client.send(&initiate()).await,
            Err(SignalingError::NotConnected)
        ));

        client.connect().await.unwrap();
        client.send(&initiate()).await.unwrap();
        assert_eq!(channel.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_recv_skips_malformed_frames() {
        let channel = Arc::new(MockChannel::default());
        let good = SignalingMessage::Failed(FailedPayload {
            reason: "offline".to_string(),
            room: None,
        });
        channel.inbound.lock().extend([
            Ok("not json".to_string()),
            Ok(r#"{"event":"call:accepted","data":{"responder":{"id":" ","username":"b"},"peerId":null}}"#.to_string()),
            Ok(serde_json::to_string(&good).unwrap()),
        ]);
        let client = SignalingClient::new(channel, UserId::new("u1"), ReconnectPolicy::default());
        client.connect().await.unwrap();

        assert_eq!(client.recv().await.unwrap(), good);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_backoff() {
        let channel = Arc::new(MockChannel::default());
        channel.connect_failures.store(2, Ordering::SeqCst);
        let client = SignalingClient::new(channel.clone(), UserId::new("u1"), ReconnectPolicy::default());

        client.connect().await.unwrap();
        assert_eq!(channel.connects.load(Ordering::SeqCst), 3);
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up() {
        let channel = Arc::new(MockChannel::default());
        channel.connect_failures.store(10, Ordering::SeqCst);
        let policy = ReconnectPolicy {
            max_attempts: 2,
            ..ReconnectPolicy::default()
        };
        let client = SignalingClient::new(channel.clone(), UserId::new("u1"), policy);

        assert!(matches!(
            client.connect().await,
            Err(SignalingError::Channel(ChannelError::Io(_)))
        ));
        assert_eq!(channel.connects.load(Ordering::SeqCst), 3);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_rejoins_rooms() {
        let channel = Arc::new(MockChannel::default());
        let client = SignalingClient::new(channel.clone(), UserId::new("u1"), ReconnectPolicy::default());
        client.connect().await.unwrap();
        client.join_room(&RoomId::new("u1_u2")).await.unwrap();

        let good = SignalingMessage::Ended(RoutingPayload::default());
        channel.inbound.lock().extend([
            Err(ChannelError::Io("reset".to_string())),
            Ok(serde_json::to_string(&good).unwrap()),
        ]);

        assert_eq!(client.recv().await.unwrap(), good);
        assert_eq!(
            channel.joins.lock().as_slice(),
            &[RoomId::new("u1_u2"), RoomId::new("u1_u2")]
        );
    }

    #[tokio::test]
    async fn test_refused_join_can_be_retried() {
        let channel = Arc::new(MockChannel::default());
        channel.join_failures.store(1, Ordering::SeqCst);
        let client = SignalingClient::new(channel.clone(), UserId::new("u1"), ReconnectPolicy::default());
        client.connect().await.unwrap();

        let team = RoomId::new("team");
        assert!(matches!(
            client.join_room(&team).await,
            Err(SignalingError::Channel(ChannelError::Rejected(_)))
        ));
        assert!(client.joined_rooms().is_empty());

        assert!(client.join_room(&team).await.unwrap());
        assert!(!client.join_room(&team).await.unwrap());
        assert_eq!(channel.joins.lock().as_slice(), &[team.clone()]);
        assert_eq!(client.joined_rooms(), vec![team]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_left_rooms_are_not_rejoined() {
        let channel = Arc::new(MockChannel::default());
        let client = SignalingClient::new(channel.clone(), UserId::new("u1"), ReconnectPolicy::default());
        client.connect().await.unwrap();
        client.join_room(&RoomId::new("team")).await.unwrap();
        client.join_room(&RoomId::new("u1_u2")).await.unwrap();

        client.leave_room(&RoomId::new("u1_u2")).await.unwrap();
        client.leave_room(&RoomId::new("never-joined")).await.unwrap();
        assert_eq!(channel.leaves.lock().as_slice(), &[RoomId::new("u1_u2")]);
        assert_eq!(client.joined_rooms(), vec![RoomId::new("team")]);

        let good = SignalingMessage::Ended(RoutingPayload::default());
        channel.inbound.lock().extend([
            Err(ChannelError::Io("reset".to_string())),
            Ok(serde_json::to_string(&good).unwrap()),
        ]);
        assert_eq!(client.recv().await.unwrap(), good);
        assert_eq!(
            channel.joins.lock().as_slice(),
            &[RoomId::new("team"), RoomId::new("u1_u2"), RoomId::new("team")]
        );
    }

    #[tokio::test]
    async fn test_disconnect_stops_recv() {
        let channel = Arc::new(MockChannel::default());
        let client = SignalingClient::new(channel, UserId::new("u1"), ReconnectPolicy::default());
        client.connect().await.unwrap();
        client.disconnect().await;
        assert!(matches!(client.recv().await, Err(SignalingError::NotConnected)));
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
