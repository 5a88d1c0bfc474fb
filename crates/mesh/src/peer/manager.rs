//! Peer arena
//!
//! Entries are keyed by remote peer ID and owned by the session task, so
//! the arena needs no locking. Each entry remembers the generation its
//! connection was created for; generation-checked accessors ignore callers
//! holding a stale generation.

use super::connection::{MeshConnection, RemoteStream, RemoteTrack, TrackReplacement};
use crate::config::MAX_MESH_PEERS;
use crate::media::MediaTrack;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One remote participant
pub struct PeerEntry {
    pub peer_id: String,
    pub generation: u64,
    pub connection: Arc<dyn MeshConnection>,
    pub remote_stream: Option<RemoteStream>,
}

/// Result of replacing the outgoing video on one peer
#[derive(Debug)]
pub struct ReplacementOutcome {
    pub peer_id: String,
    pub generation: u64,
    pub result: Result<TrackReplacement>,
}

/// Owns every live peer connection of a session
pub struct PeerManager {
    peers: HashMap<String, PeerEntry>,
    max_peers: u32,
}

impl PeerManager {
    /// Create a new peer manager
    ///
    /// # Arguments
    ///
    /// * `max_peers` - Maximum number of simultaneous peer connections (1-16)
    pub fn new(max_peers: u32) -> Result<Self> {
        if max_peers == 0 || max_peers > MAX_MESH_PEERS {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-{}, got {}",
                MAX_MESH_PEERS, max_peers
            )));
        }

        Ok(Self {
            peers: HashMap::new(),
            max_peers,
        })
    }

    /// Add a connection as a new entry
    ///
    /// # Errors
    ///
    /// Returns error if max_peers limit is reached or the peer already exists.
    pub fn add_peer(&mut self, connection: Arc<dyn MeshConnection>) -> Result<()> {
        let peer_id = connection.peer_id().to_string();

        if self.peers.contains_key(&peer_id) {
            return Err(Error::PeerConnectionError(format!(
                "Peer {} already exists",
                peer_id
            )));
        }

        if self.peers.len() >= self.max_peers as usize {
            return Err(Error::PeerConnectionError(format!(
                "Maximum peer limit reached ({})",
                self.max_peers
            )));
        }

        info!("Adding peer to manager: {}", peer_id);
        self.peers.insert(
            peer_id.clone(),
            PeerEntry {
                peer_id,
                generation: connection.generation(),
                connection,
                remote_stream: None,
            },
        );

        Ok(())
    }

    /// Remove an entry and close its connection
    ///
    /// With `generation` set, only an entry of that generation is removed.
    pub async fn remove_peer(&mut self, peer_id: &str, generation: Option<u64>) -> Result<()> {
        match self.peers.get(peer_id) {
            Some(entry) if generation.map_or(true, |g| g == entry.generation) => {}
            Some(entry) => {
                debug!(
                    "Not removing peer {}: generation {} is live, {:?} requested",
                    peer_id, entry.generation, generation
                );
                return Ok(());
            }
            None => return Err(Error::PeerNotFound(peer_id.to_string())),
        }

        if let Some(entry) = self.peers.remove(peer_id) {
            info!("Removing peer from manager: {}", peer_id);
            if let Err(e) = entry.connection.close().await {
                warn!("Error closing peer connection for {}: {}", peer_id, e);
            }
        }

        Ok(())
    }

    /// Connection of `peer_id` if it is still at `generation`
    pub fn connection_for(&self, peer_id: &str, generation: u64) -> Option<Arc<dyn MeshConnection>> {
        self.peers
            .get(peer_id)
            .filter(|entry| entry.generation == generation)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Record a remote track on the entry; false if the generation is stale
    pub fn attach_remote_track(&mut self, peer_id: &str, generation: u64, track: RemoteTrack) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(entry) if entry.generation == generation => {
                debug!("Remote {} track {} from {}", track.kind, track.track_id, peer_id);
                entry
                    .remote_stream
                    .get_or_insert_with(RemoteStream::default)
                    .add_track(track);
                true
            }
            _ => false,
        }
    }

    /// Swap the outgoing video track on every peer independently
    ///
    /// One peer's failure does not stop the others; every outcome is
    /// returned for the caller to act on.
    pub async fn replace_outgoing_video_track(
        &self,
        track: Option<&MediaTrack>,
    ) -> Vec<ReplacementOutcome> {
        let mut outcomes = Vec::with_capacity(self.peers.len());

        for entry in self.peers.values() {
            let result = entry.connection.replace_video_track(track).await;
            if let Err(e) = &result {
                warn!("Failed to replace video track for peer {}: {}", entry.peer_id, e);
            }
            outcomes.push(ReplacementOutcome {
                peer_id: entry.peer_id.clone(),
                generation: entry.generation,
                result,
            });
        }

        outcomes
    }

    pub fn remote_stream(&self, peer_id: &str) -> Option<&RemoteStream> {
        self.peers.get(peer_id).and_then(|e| e.remote_stream.as_ref())
    }

    /// Remove all peers without closing them
    pub fn drain(&mut self) -> Vec<PeerEntry> {
        self.peers.drain().map(|(_, entry)| entry).collect()
    }

    /// Remove all peers and close their connections
    pub async fn clear(&mut self) {
        debug!("Clearing all peers from manager");

        for entry in self.drain() {
            debug!("Closing connection for peer: {}", entry.peer_id);
            if let Err(e) = entry.connection.close().await {
                warn!("Error closing peer {}: {}", entry.peer_id, e);
            }
        }
    }
}
