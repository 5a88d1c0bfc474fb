//! Observable mesh state for the UI

use super::state::{Phase, RemovalReason};
use crate::media::{MediaError, MediaStream};
use crate::peer::{ConnectionState, NegotiationState, RemoteStream};
use serde::Serialize;

/// One remote peer as seen by the UI
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub negotiation: NegotiationState,
    pub connection: ConnectionState,
    pub remote_stream: Option<RemoteStream>,
}

/// Point-in-time view of a session, published after every handled batch
#[derive(Debug, Clone)]
pub struct MeshSnapshot {
    pub local_peer_id: String,
    pub phase: Phase,
    pub local_stream: Option<MediaStream>,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub screen_sharing: bool,
    pub media_error: Option<MediaError>,
    /// Ordered by peer ID
    pub peers: Vec<PeerSnapshot>,
}

impl MeshSnapshot {
    pub(crate) fn initial(local_peer_id: &str) -> Self {
        Self {
            local_peer_id: local_peer_id.to_string(),
            phase: Phase::Idle,
            local_stream: None,
            video_enabled: true,
            audio_enabled: true,
            screen_sharing: false,
            media_error: None,
            peers: Vec::new(),
        }
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }

    /// Remote streams of peers that have sent at least one track
    pub fn remote_streams(&self) -> Vec<(String, RemoteStream)> {
        self.peers
            .iter()
            .filter_map(|p| p.remote_stream.clone().map(|s| (p.peer_id.clone(), s)))
            .collect()
    }
}

/// Toast-level event for the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum MeshNotice {
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    PeerDropped { peer_id: String, reason: RemovalReason },
    /// Camera/microphone could not be acquired; the session continues without
    MediaUnavailable { error: MediaError },
    /// Display capture was refused or could not be applied
    ScreenShareFailed { error: String },
    /// One peer kept its previous outgoing video
    TrackReplacementFailed { peer_id: String, error: String },
}
