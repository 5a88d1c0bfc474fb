//! Signaling channel adapter
//!
//! The mesh only needs a room-scoped broadcast bus carrying
//! [`SignalingMessage`] envelopes. [`InMemorySignalingHub`] serves a single
//! process; the `websocket` module carries the same envelope over a relay.

pub mod channel;
pub mod protocol;
pub mod websocket;

pub use channel::{InMemorySignalingChannel, InMemorySignalingHub, SignalingChannel};
pub use protocol::{IceCandidatePayload, MessageKind, SessionDescriptionPayload, SignalingMessage};
pub use websocket::{SignalingRelay, WebSocketSignalingChannel};
