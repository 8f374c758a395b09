//! Huddle - call negotiation and active-call media core for a chat client
//!
//! This library implements the peer-to-peer call subsystem of a real-time chat
//! client. It features:
//!
//! - **Event-channel signaling**: call setup over the chat server connection,
//!   every message a validated, tagged variant
//! - **Single-owner state machine**: idle → outgoing/incoming → connected →
//!   idle, with every failure path resolving to idle
//! - **Peer link management**: one transport identity, one link per remote
//!   peer, idempotent cleanup
//! - **Active sessions**: group participants, grid layout, duration timer and
//!   recording of a remote stream
//!
//! The chat server connection, the direct peer transport and the capture
//! devices are traits ([`EventChannel`], [`PeerTransport`], [`MediaDevices`]);
//! the `loopback` feature provides in-process implementations of all three.
//!
//! # Examples
//!
//! ```rust,no_run
//! use huddle_core::loopback::{LoopbackHub, LoopbackPeerNetwork, SyntheticDevices};
//! use huddle_core::{CallService, Participant};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = LoopbackHub::new();
//! let network = LoopbackPeerNetwork::new();
//!
//! let service = CallService::builder(Participant::new("u1", "alice"))
//!     .with_channel(Arc::new(hub.channel()))
//!     .with_transport(Arc::new(network.transport()))
//!     .with_devices(Arc::new(SyntheticDevices::new()))
//!     .build()?;
//! service.start().await?;
//!
//! // Video call to u2
//! let call_id = service.call(Participant::new("u2", "bob"), true, None).await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Call types and data structures
pub mod types;

/// User and transport identifiers
pub mod identity;

/// Room identifier derivation
pub mod room;

/// Configuration
pub mod config;

/// Signaling protocol and client
pub mod signaling;

/// Local media acquisition and stream handles
pub mod media;

/// Peer link management
pub mod peer;

/// Active call session
pub mod session;

/// Call state machine
pub mod call;

/// Service orchestration
pub mod service;

/// In-process collaborators for tests and demos
#[cfg(feature = "loopback")]
pub mod loopback;

pub use call::{CallController, CallError, CallInfo};
pub use config::{BusyPolicy, CallConfig, CaptureSettings, FacingMode, ReconnectPolicy};
pub use identity::{Participant, PeerId, UserId};
pub use media::{
    LocalStream, MediaAccessError, MediaAcquisition, MediaDevices, MediaFrame, RemoteStream,
    TrackKind,
};
pub use peer::{MediaConnection, PeerError, PeerEvent, PeerLinkManager, PeerTransport};
pub use room::{direct_room, resolve_room};
pub use service::{CallService, CallServiceBuilder, ServiceError};
pub use session::{grid_layout, ActiveCallSession, RecordingArtifact};
pub use signaling::{
    ChannelError, ConnectionState, EventChannel, SignalingClient, SignalingError,
    SignalingMessage,
};
pub use types::{
    CallDirection, CallEvent, CallId, CallState, CallStatus, CallSummary, CallType, EndReason,
    GridLayout, MediaConstraints, RoomId, VideoResolution,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        CallConfig, CallEvent, CallService, CallState, CallStatus, CallSummary, EventChannel,
        Participant, PeerId, RoomId, SignalingMessage, UserId,
    };
}
