//! Peer-to-peer WebRTC mesh coordinator for StudySync study rooms
//!
//! Every participant of a room opens one WebRTC connection to every other
//! participant. Connections are negotiated over a room-scoped broadcast
//! signaling channel; there is no media server.
//!
//! # Features
//!
//! - **Presence protocol**: jittered `join` announcement, `leave` on every exit path
//! - **Negotiation**: offer/answer with deterministic glare resolution
//! - **Resilience**: bounded ICE restarts, early candidate buffering, stale result dropping
//! - **Local media**: mute toggles without renegotiation, screen share by track replacement
//! - **Signaling**: in-process hub, WebSocket client and a room relay server
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  UI                                                  │
//! │  ↕ MeshHandle (commands, snapshots, notices)         │
//! │  MeshSession task                                    │
//! │  ├─ MeshState (pure presence/negotiation machine)    │
//! │  ├─ PeerManager (one MeshConnection per peer)        │
//! │  └─ LocalMediaController (camera, mic, display)      │
//! │  ↕ SignalingChannel (join/offer/answer/ice/leave)    │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use studysync_mesh::MeshConfig;
//!
//! let config = MeshConfig {
//!     peer_id: Some("alice".to_string()),
//!     max_peers: 6,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use studysync_mesh::{
//!     MeshConfig, MeshSession, SyntheticMediaSource, WebRtcConnectionFactory,
//!     WebSocketSignalingChannel,
//! };
//!
//! # async fn example() -> studysync_mesh::Result<()> {
//! let config = MeshConfig::default();
//! let channel = WebSocketSignalingChannel::connect("ws://localhost:8080", "algebra-101").await?;
//! let factory = WebRtcConnectionFactory::new(&config)?;
//!
//! let mesh = MeshSession::start(
//!     config,
//!     Arc::new(channel),
//!     Arc::new(factory),
//!     Arc::new(SyntheticMediaSource::new()),
//! )
//! .await?;
//!
//! mesh.toggle_audio().await?;
//! mesh.leave().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod media;
pub mod mesh;
pub mod peer;
pub mod signaling;

pub use config::{MeshConfig, TurnServerConfig};
pub use error::{Error, Result};
pub use media::{
    LocalMediaController, MediaConstraints, MediaError, MediaKind, MediaSource, MediaStream,
    MediaTrack, SyntheticMediaSource,
};
pub use mesh::{MeshHandle, MeshNotice, MeshSession, MeshSnapshot, Phase, PeerSnapshot, RemovalReason};
pub use peer::{
    ConnectionFactory, ConnectionState, IceRestartPolicy, MeshConnection, NegotiationState,
    RemoteStream, RemoteTrack, WebRtcConnectionFactory,
};
pub use signaling::{
    InMemorySignalingHub, SignalingChannel, SignalingMessage, SignalingRelay,
    WebSocketSignalingChannel,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
