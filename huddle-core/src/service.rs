//! Call service orchestration
//!
//! [`CallService`] wires the signaling client, the peer link manager and the
//! call controller together and owns the background loops that feed inbound
//! signaling and peer events into the controller.

use crate::call::{CallController, CallError, CallInfo};
use crate::config::CallConfig;
use crate::identity::{Participant, PeerId};
use crate::media::{LocalStream, MediaAcquisition, MediaDevices, MediaEvent};
use crate::peer::{PeerEvent, PeerLinkManager, PeerTransport};
use crate::session::RecordingArtifact;
use crate::signaling::{ConnectionState, EventChannel, SignalingClient, SignalingError};
use crate::types::{CallEvent, CallId, CallState, CallSummary, GridLayout, RoomId};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Signaling connection error
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Main call service
pub struct CallService<C: EventChannel + 'static> {
    signaling: Arc<SignalingClient<C>>,
    peers: Arc<PeerLinkManager>,
    controller: Arc<CallController<C>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: EventChannel + 'static> CallService<C> {
    /// Start building a service for `local`
    #[must_use]
    pub fn builder(local: Participant) -> CallServiceBuilder<C> {
        CallServiceBuilder::new(local)
    }

    /// Connect signaling, register with the peer transport and start the
    /// background loops
    ///
    /// A peer transport failure is logged and does not fail startup; calls
    /// placed meanwhile cannot connect media until it recovers.
    ///
    /// # Errors
    ///
    /// Returns error if the signaling channel cannot be connected
    #[tracing::instrument(skip(self), fields(user = %self.controller.local().id))]
    pub async fn start(&self) -> Result<(), ServiceError> {
        tracing::info!("Starting call service");

        self.signaling.connect().await?;

        let mut peer_events = self.peers.subscribe_events();
        let controller = Arc::clone(&self.controller);
        let peer_loop = tokio::spawn(async move {
            loop {
                match peer_events.recv().await {
                    Ok(event) => controller.handle_peer_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Peer event loop lagging");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Err(e) = self.peers.initialize(&self.controller.local().id).await {
            tracing::error!(error = %e, "Peer transport unavailable");
        }

        let signaling = Arc::clone(&self.signaling);
        let controller = Arc::clone(&self.controller);
        let signaling_loop = tokio::spawn(async move {
            loop {
                match signaling.recv().await {
                    Ok(message) => controller.handle_message(message).await,
                    Err(SignalingError::NotConnected) => {
                        tracing::debug!("Signaling loop stopped");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Signaling lost, ending call");
                        if let Err(e) = controller.end().await {
                            tracing::warn!(error = %e, "Failed to end call after signaling loss");
                        }
                        break;
                    }
                }
            }
        });

        self.tasks.lock().extend([peer_loop, signaling_loop]);
        tracing::info!("Call service started");
        Ok(())
    }

    /// End any call, disconnect signaling and shut the peer transport down
    #[tracing::instrument(skip(self), fields(user = %self.controller.local().id))]
    pub async fn shutdown(&self) {
        if let Err(e) = self.controller.end().await {
            tracing::warn!(error = %e, "Failed to end call during shutdown");
        }
        self.signaling.disconnect().await;
        self.peers.shutdown().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("Call service stopped");
    }

    /// Join a room so room-scoped calls reach this user
    ///
    /// # Errors
    ///
    /// Returns error if the channel refuses
    pub async fn join_room(&self, room: &RoomId) -> Result<(), ServiceError> {
        self.signaling.join_room(room).await?;
        Ok(())
    }

    /// Leave a room joined with [`join_room`](Self::join_room)
    ///
    /// # Errors
    ///
    /// Returns error if the channel fails to leave
    pub async fn leave_room(&self, room: &RoomId) -> Result<(), ServiceError> {
        self.signaling.leave_room(room).await?;
        Ok(())
    }

    /// Place a 1:1 call
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be placed
    #[tracing::instrument(skip(self, callee), fields(callee = %callee.id))]
    pub async fn call(
        &self,
        callee: Participant,
        is_video: bool,
        room: Option<RoomId>,
    ) -> Result<CallId, ServiceError> {
        Ok(self.controller.initiate(callee, is_video, room).await?)
    }

    /// Place a group call
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be placed
    pub async fn call_group(
        &self,
        room: RoomId,
        participants: Vec<Participant>,
        is_video: bool,
    ) -> Result<CallId, ServiceError> {
        Ok(self
            .controller
            .initiate_group(room, participants, is_video)
            .await?)
    }

    /// Accept the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be answered
    pub async fn answer(&self) -> Result<(), ServiceError> {
        Ok(self.controller.answer().await?)
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if no call is ringing or the reply fails
    pub async fn reject(&self) -> Result<(), ServiceError> {
        Ok(self.controller.reject().await?)
    }

    /// Hang up whatever is in progress
    ///
    /// # Errors
    ///
    /// Returns error if declining a ringing call fails
    pub async fn hang_up(&self) -> Result<Option<CallSummary>, ServiceError> {
        Ok(self.controller.end().await?)
    }

    /// Flip the microphone; `None` without an audio track
    pub async fn toggle_mute(&self) -> Option<bool> {
        self.controller.toggle_mute().await
    }

    /// Flip the camera; `None` without a video track
    pub async fn toggle_camera(&self) -> Option<bool> {
        self.controller.toggle_camera().await
    }

    /// Whether the microphone is muted
    pub async fn is_muted(&self) -> bool {
        self.peers.is_muted().await
    }

    /// Whether the camera is on
    pub async fn is_camera_on(&self) -> bool {
        self.peers.is_camera_on().await
    }

    /// Start recording the first connected peer
    ///
    /// # Errors
    ///
    /// Returns error without a session or remote stream
    pub async fn start_recording(&self) -> Result<PeerId, ServiceError> {
        Ok(self.controller.start_recording().await?)
    }

    /// Stop recording and return the artifact
    ///
    /// # Errors
    ///
    /// Returns error if nothing is being recorded
    pub async fn stop_recording(&self) -> Result<RecordingArtifact, ServiceError> {
        Ok(self.controller.stop_recording().await?)
    }

    /// Current call state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.controller.state()
    }

    /// Watch call state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.controller.subscribe_state()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.controller.subscribe_events()
    }

    /// Subscribe to peer link events
    #[must_use]
    pub fn subscribe_peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.peers.subscribe_events()
    }

    /// Subscribe to local media events
    pub async fn subscribe_media_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.peers.subscribe_media_events().await
    }

    /// Snapshot of the call in progress
    pub async fn current_call(&self) -> Option<CallInfo> {
        self.controller.current_call().await
    }

    /// Grid for the connected peers
    pub async fn grid_layout(&self) -> GridLayout {
        self.controller.grid_layout().await
    }

    /// Peers with a live link
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.connected_peers()
    }

    /// Number of entries in the peer link table
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.peers.link_count()
    }

    /// Local transport identifier, once assigned
    #[must_use]
    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.peers.local_peer_id()
    }

    /// Current local capture
    pub async fn local_stream(&self) -> Option<Arc<LocalStream>> {
        self.peers.local_stream().await
    }

    /// Signaling connection state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.signaling.state()
    }

    /// Get access to the signaling client
    #[must_use]
    pub fn signaling(&self) -> &Arc<SignalingClient<C>> {
        &self.signaling
    }

    /// Get access to the peer link manager
    #[must_use]
    pub fn peers(&self) -> &Arc<PeerLinkManager> {
        &self.peers
    }
}

impl<C: EventChannel + 'static> Drop for CallService<C> {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Call service builder
pub struct CallServiceBuilder<C: EventChannel + 'static> {
    local: Participant,
    channel: Option<Arc<C>>,
    transport: Option<Arc<dyn PeerTransport>>,
    devices: Option<Arc<dyn MediaDevices>>,
    config: CallConfig,
}

impl<C: EventChannel + 'static> CallServiceBuilder<C> {
    /// Create new builder
    #[must_use]
    pub fn new(local: Participant) -> Self {
        Self {
            local,
            channel: None,
            transport: None,
            devices: None,
            config: CallConfig::default(),
        }
    }

    /// Set the event channel to the chat server
    #[must_use]
    pub fn with_channel(mut self, channel: Arc<C>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Set the direct peer transport
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the capture devices
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator is missing or the identity is blank
    pub fn build(self) -> Result<CallService<C>, ServiceError> {
        if self.local.id.is_blank() {
            return Err(ServiceError::InitError("local user id is empty".to_string()));
        }
        let channel = self
            .channel
            .ok_or_else(|| ServiceError::InitError("event channel not set".to_string()))?;
        let transport = self
            .transport
            .ok_or_else(|| ServiceError::InitError("peer transport not set".to_string()))?;
        let devices = self
            .devices
            .ok_or_else(|| ServiceError::InitError("media devices not set".to_string()))?;

        let signaling = Arc::new(SignalingClient::new(
            channel,
            self.local.id.clone(),
            self.config.reconnect.clone(),
        ));
        let media = MediaAcquisition::new(devices, self.config.capture.clone());
        let peers = Arc::new(PeerLinkManager::new(transport, media));
        let controller = CallController::new(
            self.local,
            Arc::clone(&signaling),
            Arc::clone(&peers),
            self.config,
        );

        Ok(CallService {
            signaling,
            peers,
            controller,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(all(test, feature = "loopback"))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackChannel, LoopbackHub, LoopbackPeerNetwork, SyntheticDevices};

    #[test]
    fn test_builder_requires_collaborators() {
        let result = CallService::<LoopbackChannel>::builder(Participant::new("u1", "alice")).build();
        assert!(matches!(result, Err(ServiceError::InitError(_))));
    }

    #[test]
    fn test_builder_rejects_blank_identity() {
        let hub = LoopbackHub::new();
        let result = CallService::builder(Participant::new(" ", "nobody"))
            .with_channel(Arc::new(hub.channel()))
            .with_transport(Arc::new(LoopbackPeerNetwork::new().transport()))
            .with_devices(Arc::new(SyntheticDevices::new()))
            .build();
        assert!(matches!(result, Err(ServiceError::InitError(_))));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let hub = LoopbackHub::new();
        let network = LoopbackPeerNetwork::new();
        let service = CallService::builder(Participant::new("u1", "alice"))
            .with_channel(Arc::new(hub.channel()))
            .with_transport(Arc::new(network.transport()))
            .with_devices(Arc::new(SyntheticDevices::new()))
            .build()
            .unwrap();

        service.start().await.unwrap();
        service.peers().wait_for_identity(None).await.unwrap();
        assert_eq!(service.connection_state(), ConnectionState::Connected);
        assert!(service.local_peer_id().is_some());
        assert_eq!(network.endpoint_count(), 1);

        service.shutdown().await;
        assert_eq!(service.connection_state(), ConnectionState::Closed);
        assert_eq!(network.endpoint_count(), 0);
        assert_eq!(service.state(), CallState::Idle);
    }
}
