//! WebRTC peer connection management
//!
//! Handles the per-peer connection seam, the peer arena and ICE restart policy.

pub mod connection;
pub mod lifecycle;
pub mod manager;

pub use connection::{
    ConnectionEvent, ConnectionFactory, ConnectionState, MeshConnection, NegotiationState,
    PeerConnection, RemoteStream, RemoteTrack, TrackReplacement, WebRtcConnectionFactory,
};
pub use lifecycle::IceRestartPolicy;
pub use manager::{PeerEntry, PeerManager, ReplacementOutcome};
