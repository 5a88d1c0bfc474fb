//! Mesh presence protocol and session runtime

pub mod session;
pub mod snapshot;
pub mod state;

pub use session::{MeshHandle, MeshSession};
pub use snapshot::{MeshNotice, MeshSnapshot, PeerSnapshot};
pub use state::{is_polite, Effect, MeshEvent, MeshState, Phase, PeerState, RemovalReason, StateConfig};
