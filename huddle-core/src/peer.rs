//! Peer link management
//!
//! The direct peer transport (the thing that hands out a transport identifier
//! and carries media between two clients) is abstracted behind
//! [`PeerTransport`] and [`MediaConnection`]. [`PeerLinkManager`] owns one
//! transport identity and the table of live connections keyed by remote
//! [`PeerId`].

use crate::identity::{PeerId, UserId};
use crate::media::{LocalStream, MediaAccessError, MediaAcquisition, RemoteStream};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Peer transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// The transport could not be brought up
    #[error("Transport initialization failed: {0}")]
    TransportInit(String),

    /// No transport identity yet
    #[error("Transport not initialized")]
    NotInitialized,

    /// A single connection failed
    #[error("Connection to {peer} failed: {reason}")]
    Connection {
        /// Remote peer
        peer: PeerId,
        /// Failure description
        reason: String,
    },

    /// The transport identifier was not assigned in time
    #[error("Timed out waiting for transport identity")]
    IdentityTimeout,
}

/// A direct media connection with one remote peer
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Unique id of this connection instance
    fn connection_id(&self) -> Uuid;

    /// The remote end
    fn remote_peer(&self) -> &PeerId;

    /// Accept an inbound connection, sending `stream` back
    async fn answer(&self, stream: Arc<LocalStream>) -> Result<(), PeerError>;

    /// Close the connection. Closing twice is harmless.
    async fn close(&self);
}

/// Events reported by a [`PeerTransport`]
pub enum TransportEvent {
    /// The transport assigned our identifier
    IdentityAssigned(PeerId),
    /// A remote peer is calling us
    Incoming(Arc<dyn MediaConnection>),
    /// Remote media arrived on a connection
    Stream {
        /// Remote peer
        peer: PeerId,
        /// Connection the stream belongs to
        connection_id: Uuid,
        /// The inbound stream
        stream: Arc<RemoteStream>,
    },
    /// A connection closed
    Closed {
        /// Remote peer
        peer: PeerId,
        /// Connection that closed
        connection_id: Uuid,
    },
    /// A connection failed
    ConnectionError {
        /// Remote peer
        peer: PeerId,
        /// Connection that failed
        connection_id: Uuid,
        /// Failure description
        reason: String,
    },
    /// Transport-level failure
    Error(String),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdentityAssigned(id) => f.debug_tuple("IdentityAssigned").field(id).finish(),
            Self::Incoming(conn) => f.debug_tuple("Incoming").field(conn.remote_peer()).finish(),
            Self::Stream { peer, .. } => f.debug_struct("Stream").field("peer", peer).finish(),
            Self::Closed { peer, .. } => f.debug_struct("Closed").field("peer", peer).finish(),
            Self::ConnectionError { peer, reason, .. } => f
                .debug_struct("ConnectionError")
                .field("peer", peer)
                .field("reason", reason)
                .finish(),
            Self::Error(reason) => f.debug_tuple("Error").field(reason).finish(),
        }
    }
}

/// Direct peer transport
///
/// One transport per client. `open` registers the identity and returns the
/// event stream; the identifier itself arrives later as
/// [`TransportEvent::IdentityAssigned`].
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Register with the transport
    async fn open(
        &self,
        identity: &UserId,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, PeerError>;

    /// Place an outbound media connection
    async fn call(
        &self,
        remote: &PeerId,
        stream: Arc<LocalStream>,
    ) -> Result<Arc<dyn MediaConnection>, PeerError>;

    /// Tear the transport down
    async fn close(&self);
}

/// Transport status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    /// `initialize` not called yet
    Uninitialized,
    /// Waiting for the identifier
    Initializing,
    /// Identifier assigned
    Ready(PeerId),
    /// Transport failed
    Failed(String),
}

/// Peer link events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Our transport identifier is known
    IdentityAssigned {
        /// Local transport identifier
        peer_id: PeerId,
    },
    /// A connection was registered
    PeerConnected {
        /// Remote peer
        peer: PeerId,
    },
    /// Remote media arrived
    StreamReceived {
        /// Remote peer
        peer: PeerId,
        /// Whether the stream carries video
        video: bool,
    },
    /// A connection was removed
    PeerDisconnected {
        /// Remote peer
        peer: PeerId,
        /// Error that caused the removal, if any
        reason: Option<String>,
    },
    /// Transport-level failure
    TransportError {
        /// Failure description
        reason: String,
    },
    /// All links were torn down
    Cleared,
}

struct PeerLink {
    connection: Arc<dyn MediaConnection>,
    remote_stream: Option<Arc<RemoteStream>>,
}

struct LinkState {
    media: tokio::sync::Mutex<MediaAcquisition>,
    links: RwLock<HashMap<PeerId, PeerLink>>,
    // Streams that arrived before their outbound connection was registered
    early_streams: Mutex<HashMap<Uuid, Arc<RemoteStream>>>,
    status: watch::Sender<TransportStatus>,
    event_sender: broadcast::Sender<PeerEvent>,
}

impl LinkState {
    fn emit(&self, event: PeerEvent) {
        let _ = self.event_sender.send(event);
    }

    /// Insert a connection, returning the one it displaced
    fn register(&self, connection: Arc<dyn MediaConnection>) -> Option<Arc<dyn MediaConnection>> {
        let peer = connection.remote_peer().clone();
        let remote_stream = self
            .early_streams
            .lock()
            .remove(&connection.connection_id());
        let video = remote_stream.as_ref().map(|stream| stream.has_video());
        let previous = self.links.write().insert(
            peer.clone(),
            PeerLink {
                connection,
                remote_stream,
            },
        );
        tracing::info!(peer = %peer, "Peer link registered");
        self.emit(PeerEvent::PeerConnected { peer: peer.clone() });
        if let Some(video) = video {
            self.emit(PeerEvent::StreamReceived { peer, video });
        }
        previous.map(|link| link.connection)
    }

    /// Remove `peer` only if its entry is still `connection_id`
    fn remove_if_current(&self, peer: &PeerId, connection_id: Uuid) -> bool {
        let mut links = self.links.write();
        let current = links
            .get(peer)
            .is_some_and(|link| link.connection.connection_id() == connection_id);
        if current {
            links.remove(peer);
        }
        current
    }

    async fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::IdentityAssigned(peer_id) => {
                tracing::info!(peer_id = %peer_id, "Transport identity assigned");
                self.status
                    .send_replace(TransportStatus::Ready(peer_id.clone()));
                self.emit(PeerEvent::IdentityAssigned { peer_id });
            }
            TransportEvent::Incoming(connection) => {
                let peer = connection.remote_peer().clone();
                let local = self.media.lock().await.local_stream();
                let Some(local) = local else {
                    tracing::warn!(peer = %peer, "Dropping inbound connection: no local stream");
                    connection.close().await;
                    return;
                };
                match connection.answer(local).await {
                    Ok(()) => {
                        if let Some(previous) = self.register(connection) {
                            previous.close().await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "Failed to answer inbound connection");
                        connection.close().await;
                    }
                }
            }
            TransportEvent::Stream {
                peer,
                connection_id,
                stream,
            } => {
                let video = stream.has_video();
                let stream_for_later = Arc::clone(&stream);
                let attached = {
                    let mut links = self.links.write();
                    match links.get_mut(&peer) {
                        Some(link) if link.connection.connection_id() == connection_id => {
                            link.remote_stream = Some(stream);
                            true
                        }
                        _ => false,
                    }
                };
                if attached {
                    tracing::debug!(peer = %peer, video, "Remote stream received");
                    self.emit(PeerEvent::StreamReceived { peer, video });
                } else {
                    tracing::debug!(peer = %peer, "Holding stream until its link is registered");
                    self.early_streams.lock().insert(connection_id, stream_for_later);
                }
            }
            TransportEvent::Closed {
                peer,
                connection_id,
            } => {
                if self.remove_if_current(&peer, connection_id) {
                    tracing::info!(peer = %peer, "Peer link closed");
                    self.emit(PeerEvent::PeerDisconnected { peer, reason: None });
                }
            }
            TransportEvent::ConnectionError {
                peer,
                connection_id,
                reason,
            } => {
                if self.remove_if_current(&peer, connection_id) {
                    tracing::warn!(peer = %peer, reason = %reason, "Peer link failed");
                    self.emit(PeerEvent::PeerDisconnected {
                        peer,
                        reason: Some(reason),
                    });
                }
            }
            TransportEvent::Error(reason) => {
                tracing::error!(reason = %reason, "Peer transport error");
                self.status.send_if_modified(|status| {
                    if matches!(status, TransportStatus::Ready(_)) {
                        false
                    } else {
                        *status = TransportStatus::Failed(reason.clone());
                        true
                    }
                });
                self.emit(PeerEvent::TransportError { reason });
            }
        }
    }
}

/// Owner of the transport identity and the peer link table
pub struct PeerLinkManager {
    transport: Arc<dyn PeerTransport>,
    state: Arc<LinkState>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLinkManager {
    /// Create a manager over a transport and the local media owner
    #[must_use]
    pub fn new(transport: Arc<dyn PeerTransport>, media: MediaAcquisition) -> Self {
        let (status, _) = watch::channel(TransportStatus::Uninitialized);
        let (event_sender, _) = broadcast::channel(256);
        Self {
            transport,
            state: Arc::new(LinkState {
                media: tokio::sync::Mutex::new(media),
                links: RwLock::new(HashMap::new()),
                early_streams: Mutex::new(HashMap::new()),
                status,
                event_sender,
            }),
            event_loop: Mutex::new(None),
        }
    }

    /// Register with the transport and start processing its events
    ///
    /// Returns once registration is submitted; the identifier arrives as
    /// [`PeerEvent::IdentityAssigned`]. Calling it again while initializing or
    /// ready is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses registration. The failure is
    /// also recorded in [`transport_status`](Self::transport_status).
    pub async fn initialize(&self, identity: &UserId) -> Result<(), PeerError> {
        let proceed = self.state.status.send_if_modified(|status| match status {
            TransportStatus::Initializing | TransportStatus::Ready(_) => false,
            _ => {
                *status = TransportStatus::Initializing;
                true
            }
        });
        if !proceed {
            return Ok(());
        }

        let mut events = match self.transport.open(identity).await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(identity = %identity, error = %e, "Failed to open peer transport");
                self.state
                    .status
                    .send_replace(TransportStatus::Failed(e.to_string()));
                self.state.emit(PeerEvent::TransportError {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                state.handle(event).await;
            }
            tracing::debug!("Peer transport event stream ended");
        });
        if let Some(previous) = self.event_loop.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Current transport status
    #[must_use]
    pub fn transport_status(&self) -> TransportStatus {
        self.state.status.borrow().clone()
    }

    /// Local transport identifier, once assigned
    #[must_use]
    pub fn local_peer_id(&self) -> Option<PeerId> {
        match &*self.state.status.borrow() {
            TransportStatus::Ready(id) => Some(id.clone()),
            _ => None,
        }
    }

    /// Wait for the transport identifier
    ///
    /// With `timeout = None` this waits as long as it takes.
    ///
    /// # Errors
    ///
    /// Returns `TransportInit` if the transport failed, `IdentityTimeout` if
    /// the bound elapsed first.
    pub async fn wait_for_identity(&self, timeout: Option<Duration>) -> Result<PeerId, PeerError> {
        let mut status = self.state.status.subscribe();
        let wait = async move {
            loop {
                match &*status.borrow_and_update() {
                    TransportStatus::Ready(id) => return Ok(id.clone()),
                    TransportStatus::Failed(reason) => {
                        return Err(PeerError::TransportInit(reason.clone()))
                    }
                    _ => {}
                }
                if status.changed().await.is_err() {
                    return Err(PeerError::NotInitialized);
                }
            }
        };
        match timeout {
            Some(bound) => tokio::time::timeout(bound, wait)
                .await
                .map_err(|_| PeerError::IdentityTimeout)?,
            None => wait.await,
        }
    }

    /// Capture local media for a call
    ///
    /// # Errors
    ///
    /// Returns error if the platform denies access or has no device.
    pub async fn acquire_media(&self, wants_video: bool) -> Result<Arc<LocalStream>, MediaAccessError> {
        self.state.media.lock().await.acquire(wants_video).await
    }

    /// Stop `stream` if it is still the current capture; links stay open
    pub async fn release_media(&self, stream: &Arc<LocalStream>) -> bool {
        self.state.media.lock().await.release_if_current(stream)
    }

    /// Current local stream
    pub async fn local_stream(&self) -> Option<Arc<LocalStream>> {
        self.state.media.lock().await.local_stream()
    }

    /// Flip the microphone; `None` when there is no audio track
    pub async fn toggle_mute(&self) -> Option<bool> {
        self.state.media.lock().await.toggle_mute()
    }

    /// Flip the camera; `None` when there is no video track
    pub async fn toggle_camera(&self) -> Option<bool> {
        self.state.media.lock().await.toggle_camera()
    }

    /// Whether the microphone is muted
    pub async fn is_muted(&self) -> bool {
        self.state.media.lock().await.is_muted()
    }

    /// Whether the camera is on
    pub async fn is_camera_on(&self) -> bool {
        self.state.media.lock().await.is_camera_on()
    }

    /// Connect to a remote peer with the current local stream
    ///
    /// Without a local stream this logs a warning and does nothing. An
    /// existing link to the same peer is closed first.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` before the identity is assigned, or the
    /// transport's connection error.
    #[tracing::instrument(skip(self), fields(peer = %peer))]
    pub async fn connect(&self, peer: &PeerId) -> Result<(), PeerError> {
        let Some(local) = self.local_stream().await else {
            tracing::warn!("Cannot connect without a local stream");
            return Ok(());
        };
        if self.local_peer_id().is_none() {
            return Err(PeerError::NotInitialized);
        }

        let previous = self.state.links.write().remove(peer);
        if let Some(previous) = previous {
            tracing::debug!("Replacing existing peer link");
            previous.connection.close().await;
        }

        let connection = self.transport.call(peer, local).await?;
        if let Some(displaced) = self.state.register(connection) {
            displaced.close().await;
        }
        Ok(())
    }

    /// Close and remove one link; absent peers are ignored
    pub async fn disconnect(&self, peer: &PeerId) {
        let removed = self.state.links.write().remove(peer);
        if let Some(link) = removed {
            link.connection.close().await;
            tracing::info!(peer = %peer, "Peer link disconnected");
            self.state.emit(PeerEvent::PeerDisconnected {
                peer: peer.clone(),
                reason: None,
            });
        }
    }

    /// Close every link and stop local capture
    ///
    /// The transport identity is kept so the next call does not have to
    /// register again. Safe to call any number of times.
    pub async fn cleanup(&self) {
        let drained: Vec<(PeerId, PeerLink)> = self.state.links.write().drain().collect();
        self.state.early_streams.lock().clear();
        let closed = drained.len();
        join_all(drained.iter().map(|(_, link)| link.connection.close())).await;
        self.state.media.lock().await.release();
        tracing::debug!(closed, "Peer links cleaned up");
        self.state.emit(PeerEvent::Cleared);
    }

    /// Clean up and shut the transport down
    pub async fn shutdown(&self) {
        self.cleanup().await;
        self.transport.close().await;
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
        self.state
            .status
            .send_replace(TransportStatus::Uninitialized);
    }

    /// Peers with a registered link, sorted
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.state.links.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Number of links in the table
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.state.links.read().len()
    }

    /// Inbound stream from `peer`, once it arrived
    #[must_use]
    pub fn remote_stream(&self, peer: &PeerId) -> Option<Arc<RemoteStream>> {
        self.state
            .links
            .read()
            .get(peer)
            .and_then(|link| link.remote_stream.clone())
    }

    /// Subscribe to peer link events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.state.event_sender.subscribe()
    }

    /// Subscribe to media events of the underlying capture
    pub async fn subscribe_media_events(&self) -> broadcast::Receiver<crate::media::MediaEvent> {
        self.state.media.lock().await.subscribe_events()
    }
}

impl Drop for PeerLinkManager {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
    }
}
