//! Configuration types for the mesh coordinator

use crate::media::MediaConstraints;
use crate::peer::IceRestartPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound for `max_peers`; a full mesh costs one uplink per peer
pub const MAX_MESH_PEERS: u32 = 16;

/// Upper bound for the join announcement jitter
pub const MAX_JOIN_JITTER_MS: u64 = 10_000;

/// Main configuration for a mesh session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Local peer ID (auto-generated if None)
    pub peer_id: Option<String>,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Maximum remote peers in the mesh (default: 8, max: 16)
    pub max_peers: u32,

    /// Upper bound of the random delay before announcing `join` (default: 1000ms)
    pub join_jitter_max_ms: u64,

    /// ICE restart budget and backoff
    pub ice_restart: IceRestartPolicy,

    /// Buffer ICE candidates that arrive before any offer/answer (default: true)
    pub buffer_early_candidates: bool,

    /// Maximum buffered candidates per peer (default: 64)
    pub candidate_buffer_limit: usize,

    /// Tear down peers stuck in have-local-offer after this many seconds.
    /// Disabled when None (default).
    pub offer_timeout_secs: Option<u64>,

    /// Constraints for the initial capture request
    pub media: MediaConstraints,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            max_peers: 8,
            join_jitter_max_ms: 1000,
            ice_restart: IceRestartPolicy::default(),
            buffer_early_candidates: true,
            candidate_buffer_limit: 64,
            offer_timeout_secs: None,
            media: MediaConstraints::default(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from a YAML document
    ///
    /// Missing keys fall back to their defaults. The result is validated.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: MeshConfig = serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse YAML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - no STUN or TURN server is configured, or a URL has the wrong scheme
    /// - `peer_id` is set but empty
    /// - `max_peers` is not in range 1-16
    /// - `join_jitter_max_ms` exceeds 10000
    /// - `candidate_buffer_limit` is 0 while buffering is enabled
    /// - `offer_timeout_secs` is `Some(0)`
    /// - the ICE restart policy is inconsistent
    pub fn validate(&self) -> Result<()> {
        if self.stun_servers.is_empty() && self.turn_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN or TURN server is required".to_string(),
            ));
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if let Some(peer_id) = &self.peer_id {
            if peer_id.trim().is_empty() {
                return Err(Error::InvalidConfig("peer_id must not be empty".to_string()));
            }
        }

        if self.max_peers == 0 || self.max_peers > MAX_MESH_PEERS {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-{}, got {}",
                MAX_MESH_PEERS, self.max_peers
            )));
        }

        if self.join_jitter_max_ms > MAX_JOIN_JITTER_MS {
            return Err(Error::InvalidConfig(format!(
                "join_jitter_max_ms must be at most {}, got {}",
                MAX_JOIN_JITTER_MS, self.join_jitter_max_ms
            )));
        }

        if self.buffer_early_candidates && self.candidate_buffer_limit == 0 {
            return Err(Error::InvalidConfig(
                "candidate_buffer_limit must be positive when buffering is enabled".to_string(),
            ));
        }

        if self.offer_timeout_secs == Some(0) {
            return Err(Error::InvalidConfig(
                "offer_timeout_secs must be positive when set".to_string(),
            ));
        }

        self.ice_restart.validate()?;

        Ok(())
    }

    /// The configured peer ID, or a freshly generated one
    pub fn local_peer_id(&self) -> String {
        self.peer_id
            .clone()
            .unwrap_or_else(|| format!("peer-{}", uuid::Uuid::new_v4()))
    }

    /// Upper bound of the join announcement delay
    pub fn join_jitter_max(&self) -> Duration {
        Duration::from_millis(self.join_jitter_max_ms)
    }

    /// Idle-offer timeout, if enabled
    pub fn offer_timeout(&self) -> Option<Duration> {
        self.offer_timeout_secs.map(Duration::from_secs)
    }
}
