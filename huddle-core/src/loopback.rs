//! In-process collaborators
//!
//! Everything a [`CallService`](crate::service::CallService) needs from the
//! outside world, implemented in memory:
//!
//! - [`LoopbackHub`] plays the chat server: it routes signaling frames between
//!   connected users the way the real server does;
//! - [`LoopbackChannel`] is one user's [`EventChannel`] to the hub;
//! - [`LoopbackPeerNetwork`] hands out transport identifiers and wires direct
//!   media connections, relaying frames between the two ends;
//! - [`SyntheticDevices`] fakes microphone and camera capture.
//!
//! Used by the integration tests and the `huddle demo` command.

use crate::identity::{PeerId, UserId};
use crate::media::{
    CaptureConstraints, LocalStream, LocalTrack, MediaAccessError, MediaDevices, RemoteStream,
    TrackKind,
};
use crate::peer::{MediaConnection, PeerError, PeerTransport, TransportEvent};
use crate::signaling::{
    AcceptedPayload, ChannelError, EventChannel, FailedPayload, IncomingPayload, RoutingPayload,
    SignalingMessage,
};
use crate::types::RoomId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

type Inbox = mpsc::UnboundedSender<Result<String, ChannelError>>;

#[derive(Default)]
struct HubState {
    clients: HashMap<UserId, Inbox>,
    rooms: HashMap<RoomId, BTreeSet<UserId>>,
    log: Vec<(UserId, SignalingMessage)>,
}

impl HubState {
    fn deliver(&self, user: &UserId, message: &SignalingMessage) -> bool {
        let Some(inbox) = self.clients.get(user) else {
            return false;
        };
        match serde_json::to_string(message) {
            Ok(frame) => inbox.send(Ok(frame)).is_ok(),
            Err(e) => {
                tracing::error!(error = %e, "Hub failed to encode frame");
                false
            }
        }
    }

    fn room_members(&self, room: &RoomId, except: &UserId) -> Vec<UserId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().filter(|m| *m != except).cloned().collect())
            .unwrap_or_default()
    }

    fn route(&self, from: &UserId, message: &SignalingMessage) {
        match message {
            SignalingMessage::Initiate(p) => {
                let incoming = SignalingMessage::Incoming(IncomingPayload {
                    caller: p.caller.clone(),
                    is_video: p.is_video,
                    room_id: p.room.clone(),
                    peer_id: None,
                });
                let targets = match &p.to {
                    Some(callee) => vec![callee.clone()],
                    None => self.room_members(&p.room, from),
                };
                let reached = targets
                    .iter()
                    .filter(|target| self.deliver(target, &incoming))
                    .count();
                if reached == 0 {
                    let reason = if p.to.is_some() {
                        "user offline"
                    } else {
                        "no members online"
                    };
                    self.deliver(
                        from,
                        &SignalingMessage::Failed(FailedPayload {
                            reason: reason.to_string(),
                            room: Some(p.room.clone()),
                        }),
                    );
                }
            }
            SignalingMessage::Answer(p) => {
                self.deliver(
                    &p.to,
                    &SignalingMessage::Accepted(AcceptedPayload {
                        responder: p.responder.clone(),
                        peer_id: p.peer_id.clone(),
                        room: Some(p.room.clone()),
                    }),
                );
            }
            SignalingMessage::Reject(p) => {
                self.deliver(
                    &p.to,
                    &SignalingMessage::Rejected(RoutingPayload {
                        room: Some(p.room.clone()),
                        reason: p.reason.clone(),
                    }),
                );
            }
            SignalingMessage::End(p) => {
                let ended = SignalingMessage::Ended(RoutingPayload {
                    room: Some(p.room.clone()),
                    reason: None,
                });
                for member in self.room_members(&p.room, from) {
                    self.deliver(&member, &ended);
                }
            }
            other => {
                tracing::warn!(from = %from, event = other.event_name(), "Hub dropping server-only event");
            }
        }
    }
}

/// In-memory signaling server
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel for one user
    #[must_use]
    pub fn channel(&self) -> LoopbackChannel {
        LoopbackChannel {
            hub: self.clone(),
            user: Mutex::new(None),
            inbox: tokio::sync::Mutex::new(None),
            refuse_connects: AtomicU32::new(0),
        }
    }

    /// Whether `user` is connected
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.state.lock().clients.contains_key(user)
    }

    /// Members of `room`
    #[must_use]
    pub fn room_members(&self, room: &RoomId) -> Vec<UserId> {
        self.state
            .lock()
            .rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages sent by `user`, in order
    #[must_use]
    pub fn sent_by(&self, user: &UserId) -> Vec<SignalingMessage> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(from, _)| from == user)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Push a raw frame to `user`, bypassing routing
    pub fn inject(&self, user: &UserId, frame: impl Into<String>) -> bool {
        self.state
            .lock()
            .clients
            .get(user)
            .is_some_and(|inbox| inbox.send(Ok(frame.into())).is_ok())
    }

    /// Sever `user`'s connection with an IO error
    pub fn drop_connection(&self, user: &UserId) {
        if let Some(inbox) = self.state.lock().clients.remove(user) {
            let _ = inbox.send(Err(ChannelError::Io("connection reset".to_string())));
        }
    }

    fn register(&self, user: &UserId) -> mpsc::UnboundedReceiver<Result<String, ChannelError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().clients.insert(user.clone(), tx);
        tracing::debug!(user = %user, "Hub client connected");
        rx
    }

    fn unregister(&self, user: &UserId) {
        self.state.lock().clients.remove(user);
    }

    fn join(&self, user: &UserId, room: &RoomId) {
        self.state
            .lock()
            .rooms
            .entry(room.clone())
            .or_default()
            .insert(user.clone());
    }

    fn leave(&self, user: &UserId, room: &RoomId) {
        let mut state = self.state.lock();
        if let Some(members) = state.rooms.get_mut(room) {
            members.remove(user);
            if members.is_empty() {
                state.rooms.remove(room);
            }
        }
    }

    fn receive(&self, from: &UserId, frame: &str) -> Result<(), ChannelError> {
        let message =
            SignalingMessage::decode(frame).map_err(|e| ChannelError::Rejected(e.to_string()))?;
        let mut state = self.state.lock();
        state.log.push((from.clone(), message.clone()));
        state.route(from, &message);
        Ok(())
    }
}

/// One user's connection to a [`LoopbackHub`]
pub struct LoopbackChannel {
    hub: LoopbackHub,
    user: Mutex<Option<UserId>>,
    inbox: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Result<String, ChannelError>>>>,
    refuse_connects: AtomicU32,
}

impl LoopbackChannel {
    /// Refuse the next `count` connection attempts
    pub fn refuse_next_connects(&self, count: u32) {
        self.refuse_connects.store(count, Ordering::SeqCst);
    }

    fn connected_user(&self) -> Result<UserId, ChannelError> {
        self.user.lock().clone().ok_or(ChannelError::Closed)
    }
}

#[async_trait]
impl EventChannel for LoopbackChannel {
    async fn connect(&self, user: &UserId) -> Result<(), ChannelError> {
        let refused = self
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChannelError::Io("connection refused".to_string()));
        }
        let inbox = self.hub.register(user);
        *self.inbox.lock().await = Some(inbox);
        *self.user.lock() = Some(user.clone());
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(user) = self.user.lock().take() {
            self.hub.unregister(&user);
        }
    }

    async fn join_room(&self, room: &RoomId) -> Result<(), ChannelError> {
        let user = self.connected_user()?;
        self.hub.join(&user, room);
        Ok(())
    }

    async fn leave_room(&self, room: &RoomId) -> Result<(), ChannelError> {
        let user = self.connected_user()?;
        self.hub.leave(&user, room);
        Ok(())
    }

    async fn emit(&self, frame: String) -> Result<(), ChannelError> {
        let user = self.connected_user()?;
        if !self.hub.is_online(&user) {
            return Err(ChannelError::Closed);
        }
        self.hub.receive(&user, &frame)
    }

    async fn next_frame(&self) -> Result<String, ChannelError> {
        let mut inbox = self.inbox.lock().await;
        let Some(rx) = inbox.as_mut() else {
            return Err(ChannelError::Closed);
        };
        match rx.recv().await {
            Some(frame) => frame,
            None => {
                inbox.take();
                Err(ChannelError::Closed)
            }
        }
    }
}

/// Shared state of one direct connection
struct Link {
    id: Uuid,
    caller: PeerId,
    callee: PeerId,
    caller_stream: Arc<LocalStream>,
    network: LoopbackPeerNetwork,
    closed: AtomicBool,
    relays: Mutex<Vec<JoinHandle<()>>>,
}

impl Link {
    fn relay(&self, from: &LocalStream, to: Arc<RemoteStream>) {
        let mut frames = from.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        to.push(frame);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Loopback relay lagging");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.relays.lock().push(handle);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for relay in self.relays.lock().drain(..) {
            relay.abort();
        }
        self.network.send(
            &self.caller,
            TransportEvent::Closed {
                peer: self.callee.clone(),
                connection_id: self.id,
            },
        );
        self.network.send(
            &self.callee,
            TransportEvent::Closed {
                peer: self.caller.clone(),
                connection_id: self.id,
            },
        );
    }
}

fn stream_kinds(stream: &LocalStream) -> Vec<TrackKind> {
    let mut kinds: Vec<TrackKind> = stream.tracks().iter().map(|t| t.kind).collect();
    kinds.dedup();
    kinds
}

/// One end of a loopback connection
struct LoopbackConnection {
    link: Arc<Link>,
    remote: PeerId,
    inbound: bool,
}

#[async_trait]
impl MediaConnection for LoopbackConnection {
    fn connection_id(&self) -> Uuid {
        self.link.id
    }

    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    async fn answer(&self, stream: Arc<LocalStream>) -> Result<(), PeerError> {
        if !self.inbound {
            return Err(PeerError::Connection {
                peer: self.remote.clone(),
                reason: "cannot answer an outbound connection".to_string(),
            });
        }
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(PeerError::Connection {
                peer: self.remote.clone(),
                reason: "connection closed".to_string(),
            });
        }
        let link = &self.link;

        // Caller's media towards the callee
        let to_callee = Arc::new(RemoteStream::new(
            format!("{}-from-{}", link.id, link.caller),
            link.caller.clone(),
            stream_kinds(&link.caller_stream),
        ));
        link.relay(&link.caller_stream, Arc::clone(&to_callee));

        // Callee's media towards the caller
        let to_caller = Arc::new(RemoteStream::new(
            format!("{}-from-{}", link.id, link.callee),
            link.callee.clone(),
            stream_kinds(&stream),
        ));
        link.relay(&stream, Arc::clone(&to_caller));

        link.network.send(
            &link.callee,
            TransportEvent::Stream {
                peer: link.caller.clone(),
                connection_id: link.id,
                stream: to_callee,
            },
        );
        link.network.send(
            &link.caller,
            TransportEvent::Stream {
                peer: link.callee.clone(),
                connection_id: link.id,
                stream: to_caller,
            },
        );
        Ok(())
    }

    async fn close(&self) {
        self.link.close().await;
    }
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
    withheld: Vec<PeerId>,
}

/// In-memory direct peer network
#[derive(Clone, Default)]
pub struct LoopbackPeerNetwork {
    state: Arc<Mutex<NetworkState>>,
    next_id: Arc<AtomicU64>,
}

impl LoopbackPeerNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport endpoint on this network
    #[must_use]
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            local: Mutex::new(None),
            fail_open: AtomicBool::new(false),
            withhold_identity: AtomicBool::new(false),
        }
    }

    /// Number of registered endpoints
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    /// Hand out the identifiers held back by
    /// [`LoopbackTransport::without_identity`] endpoints
    ///
    /// Returns how many endpoints received theirs.
    pub fn assign_withheld_identities(&self) -> usize {
        let mut state = self.state.lock();
        let withheld = std::mem::take(&mut state.withheld);
        withheld
            .into_iter()
            .filter(|peer| {
                state
                    .endpoints
                    .get(peer)
                    .is_some_and(|tx| tx.send(TransportEvent::IdentityAssigned(peer.clone())).is_ok())
            })
            .count()
    }

    fn send(&self, to: &PeerId, event: TransportEvent) {
        if let Some(endpoint) = self.state.lock().endpoints.get(to) {
            let _ = endpoint.send(event);
        }
    }
}

/// A [`PeerTransport`] endpoint on a [`LoopbackPeerNetwork`]
pub struct LoopbackTransport {
    network: LoopbackPeerNetwork,
    local: Mutex<Option<PeerId>>,
    fail_open: AtomicBool,
    withhold_identity: AtomicBool,
}

impl LoopbackTransport {
    /// Make `open` fail, as a broken transport server would
    #[must_use]
    pub fn failing(self) -> Self {
        self.fail_open.store(true, Ordering::SeqCst);
        self
    }

    /// Register but hold the identifier back until
    /// [`LoopbackPeerNetwork::assign_withheld_identities`]
    #[must_use]
    pub fn without_identity(self) -> Self {
        self.withhold_identity.store(true, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn open(
        &self,
        identity: &UserId,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, PeerError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(PeerError::TransportInit("transport server unreachable".to_string()));
        }
        let n = self.network.next_id.fetch_add(1, Ordering::SeqCst);
        let peer_id = PeerId::new(format!("{identity}-{n}"));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut network = self.network.state.lock();
        if self.withhold_identity.load(Ordering::SeqCst) {
            network.withheld.push(peer_id.clone());
        } else {
            let _ = tx.send(TransportEvent::IdentityAssigned(peer_id.clone()));
        }
        network.endpoints.insert(peer_id.clone(), tx);
        drop(network);
        *self.local.lock() = Some(peer_id);
        Ok(rx)
    }

    async fn call(
        &self,
        remote: &PeerId,
        stream: Arc<LocalStream>,
    ) -> Result<Arc<dyn MediaConnection>, PeerError> {
        let local = self.local.lock().clone().ok_or(PeerError::NotInitialized)?;
        let remote_endpoint = self.network.state.lock().endpoints.get(remote).cloned();
        let Some(remote_endpoint) = remote_endpoint else {
            return Err(PeerError::Connection {
                peer: remote.clone(),
                reason: "peer unavailable".to_string(),
            });
        };

        let link = Arc::new(Link {
            id: Uuid::new_v4(),
            caller: local.clone(),
            callee: remote.clone(),
            caller_stream: stream,
            network: self.network.clone(),
            closed: AtomicBool::new(false),
            relays: Mutex::new(Vec::new()),
        });
        let inbound = Arc::new(LoopbackConnection {
            link: Arc::clone(&link),
            remote: local,
            inbound: true,
        });
        remote_endpoint
            .send(TransportEvent::Incoming(inbound))
            .map_err(|_| PeerError::Connection {
                peer: remote.clone(),
                reason: "peer went away".to_string(),
            })?;

        Ok(Arc::new(LoopbackConnection {
            link,
            remote: remote.clone(),
            inbound: false,
        }))
    }

    async fn close(&self) {
        if let Some(local) = self.local.lock().take() {
            self.network.state.lock().endpoints.remove(&local);
        }
    }
}

/// Fake capture devices
#[derive(Debug, Default)]
pub struct SyntheticDevices {
    deny: AtomicBool,
    no_camera: AtomicBool,
    requests: AtomicU32,
}

impl SyntheticDevices {
    /// Devices that grant every request
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny (or allow again) every request
    pub fn set_denied(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Pretend no camera is attached
    #[must_use]
    pub fn without_camera(self) -> Self {
        self.no_camera.store(true, Ordering::SeqCst);
        self
    }

    /// Capture requests served so far
    #[must_use]
    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<LocalStream, MediaAccessError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaAccessError::PermissionDenied(
                "capture permission denied".to_string(),
            ));
        }

        let mut tracks = vec![LocalTrack::new(
            format!("mic-{n}"),
            TrackKind::Audio,
            "Synthetic microphone",
        )];
        if let Some(video) = constraints.video {
            if self.no_camera.load(Ordering::SeqCst) {
                return Err(MediaAccessError::DeviceNotFound("camera".to_string()));
            }
            tracks.push(LocalTrack::new(
                format!("cam-{n}"),
                TrackKind::Video,
                format!("Synthetic camera {}x{}", video.width, video.height),
            ));
        }
        Ok(LocalStream::new(format!("capture-{n}"), tracks))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::identity::Participant;
    use crate::signaling::InitiatePayload;

    async fn connected(hub: &LoopbackHub, user: &str) -> LoopbackChannel {
        let channel = hub.channel();
        channel.connect(&UserId::new(user)).await.unwrap();
        channel
    }

    fn initiate(to: Option<&str>, room: &str) -> String {
        SignalingMessage::Initiate(InitiatePayload {
            room: RoomId::new(room),
            is_video: false,
            caller: Participant::new("u1", "alice"),
            is_group_call: to.is_none(),
            to: to.map(UserId::new),
        })
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_initiate_reaches_callee() {
        let hub = LoopbackHub::new();
        let alice = connected(&hub, "u1").await;
        let bob = connected(&hub, "u2").await;

        alice.emit(initiate(Some("u2"), "u1_u2")).await.unwrap();
        let frame = bob.next_frame().await.unwrap();
        match SignalingMessage::decode(&frame).unwrap() {
            SignalingMessage::Incoming(p) => {
                assert_eq!(p.caller.id, UserId::new("u1"));
                assert_eq!(p.room_id, RoomId::new("u1_u2"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offline_callee_fails() {
        let hub = LoopbackHub::new();
        let alice = connected(&hub, "u1").await;

        alice.emit(initiate(Some("u9"), "u1_u9")).await.unwrap();
        let frame = alice.next_frame().await.unwrap();
        assert!(matches!(
            SignalingMessage::decode(&frame).unwrap(),
            SignalingMessage::Failed(p) if p.reason == "user offline"
        ));
    }

    #[tokio::test]
    async fn test_group_initiate_fans_out_to_room() {
        let hub = LoopbackHub::new();
        let alice = connected(&hub, "u1").await;
        let bob = connected(&hub, "u2").await;
        let carol = connected(&hub, "u3").await;
        let room = RoomId::new("team");
        for channel in [&alice, &bob, &carol] {
            channel.join_room(&room).await.unwrap();
        }

        alice.emit(initiate(None, "team")).await.unwrap();
        for channel in [&bob, &carol] {
            let frame = channel.next_frame().await.unwrap();
            assert!(matches!(
                SignalingMessage::decode(&frame).unwrap(),
                SignalingMessage::Incoming(_)
            ));
        }
        assert_eq!(hub.sent_by(&UserId::new("u1")).len(), 1);
    }

    #[tokio::test]
    async fn test_left_room_gets_no_fan_out() {
        let hub = LoopbackHub::new();
        let alice = connected(&hub, "u1").await;
        let bob = connected(&hub, "u2").await;
        let room = RoomId::new("team");
        alice.join_room(&room).await.unwrap();
        bob.join_room(&room).await.unwrap();

        bob.leave_room(&room).await.unwrap();
        assert_eq!(hub.room_members(&room), vec![UserId::new("u1")]);

        alice.emit(initiate(None, "team")).await.unwrap();
        let frame = alice.next_frame().await.unwrap();
        assert!(matches!(
            SignalingMessage::decode(&frame).unwrap(),
            SignalingMessage::Failed(p) if p.reason == "no members online"
        ));

        alice.leave_room(&room).await.unwrap();
        assert!(hub.room_members(&room).is_empty());
    }

    #[tokio::test]
    async fn test_dropped_connection_surfaces_error() {
        let hub = LoopbackHub::new();
        let bob = connected(&hub, "u2").await;
        hub.drop_connection(&UserId::new("u2"));
        assert_eq!(
            bob.next_frame().await,
            Err(ChannelError::Io("connection reset".to_string()))
        );
        assert_eq!(bob.next_frame().await, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn test_peer_network_relays_media() {
        let network = LoopbackPeerNetwork::new();
        let a = network.transport();
        let b = network.transport();
        let mut a_events = a.open(&UserId::new("u1")).await.unwrap();
        let mut b_events = b.open(&UserId::new("u2")).await.unwrap();

        let a_id = match a_events.recv().await.unwrap() {
            TransportEvent::IdentityAssigned(id) => id,
            other => panic!("unexpected {other:?}"),
        };
        let b_id = match b_events.recv().await.unwrap() {
            TransportEvent::IdentityAssigned(id) => id,
            other => panic!("unexpected {other:?}"),
        };

        let a_stream = Arc::new(LocalStream::new(
            "a",
            vec![LocalTrack::new("mic", TrackKind::Audio, "mic")],
        ));
        let b_stream = Arc::new(LocalStream::new(
            "b",
            vec![LocalTrack::new("mic", TrackKind::Audio, "mic")],
        ));

        let outbound = a.call(&b_id, Arc::clone(&a_stream)).await.unwrap();
        let inbound = match b_events.recv().await.unwrap() {
            TransportEvent::Incoming(conn) => conn,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(inbound.remote_peer(), &a_id);
        inbound.answer(b_stream).await.unwrap();

        let remote = match b_events.recv().await.unwrap() {
            TransportEvent::Stream { stream, .. } => stream,
            other => panic!("unexpected {other:?}"),
        };
        let mut frames = remote.subscribe();
        // Let the relay task subscribe before publishing
        tokio::task::yield_now().await;
        a_stream.publish(crate::media::MediaFrame::audio(vec![7u8]));
        assert_eq!(frames.recv().await.unwrap().data.as_ref(), &[7]);

        outbound.close().await;
        assert!(matches!(
            b_events.recv().await.unwrap(),
            TransportEvent::Closed { peer, .. } if peer == a_id
        ));
    }

    #[tokio::test]
    async fn test_synthetic_devices() {
        let devices = SyntheticDevices::new().without_camera();
        let settings = crate::config::CaptureSettings::default();
        let audio = CaptureConstraints::new(crate::types::MediaConstraints::audio_only(), &settings);
        let video = CaptureConstraints::new(crate::types::MediaConstraints::video_call(), &settings);

        assert!(devices.get_user_media(&audio).await.is_ok());
        assert!(matches!(
            devices.get_user_media(&video).await,
            Err(MediaAccessError::DeviceNotFound(_))
        ));
        devices.set_denied(true);
        assert!(matches!(
            devices.get_user_media(&audio).await,
            Err(MediaAccessError::PermissionDenied(_))
        ));
        assert_eq!(devices.request_count(), 3);
    }
}
