//! Error types for the mesh coordinator

/// Result type alias using the mesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mesh operations
///
/// None of these abort a running mesh: the session logs them and degrades
/// the affected peer or feature. They surface to callers only from
/// constructors and adapter setup (config validation, connecting a
/// signaling channel, creating a WebRTC API) and from handle commands sent
/// after the session ended.
///
/// Capture failures are not represented here; see [`crate::MediaError`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A `MeshConfig` field is out of range or malformed
    #[error("Invalid mesh configuration: {0}")]
    InvalidConfig(String),

    /// Publishing to or subscribing on the room channel failed
    #[error("Signaling failed: {0}")]
    SignalingError(String),

    /// No connection entry for this peer ID
    #[error("Unknown peer: {0}")]
    PeerNotFound(String),

    #[error("Peer connection failed: {0}")]
    PeerConnectionError(String),

    /// Offer/answer could not be created or applied
    #[error("SDP negotiation failed: {0}")]
    SdpError(String),

    #[error("ICE candidate rejected: {0}")]
    IceCandidateError(String),

    /// Attaching or replacing a local track failed
    #[error("Track operation failed: {0}")]
    MediaTrackError(String),

    /// Relay connection or frame error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Envelope or payload did not (de)serialize
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Well-formed but unusable input, e.g. a relay path without a room
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The session task has exited; the handle is inert
    #[error("Mesh session closed: {0}")]
    SessionClosed(String),

    /// webrtc-rs API setup error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Transport hiccups worth retrying with a fresh connection
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_) | Error::WebSocketError(_) | Error::IoError(_)
        )
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Errors scoped to a single remote peer; the rest of the mesh is unaffected
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::PeerConnectionError(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
        )
    }
}
