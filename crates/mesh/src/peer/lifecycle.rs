//! ICE restart policy
//!
//! Bounds how often a failed connection is restarted and how long the
//! offering side waits between attempts.

use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// ICE restart policy configuration
///
/// Controls how restart offers are scheduled when a peer connection
/// reports `failed`. Only the impolite side of a pair sends restart offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceRestartPolicy {
    /// Maximum number of ICE restarts per peer before teardown (default: 3)
    pub max_attempts: u32,
    /// Initial backoff delay in milliseconds (default: 500ms)
    pub backoff_initial_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 5000ms)
    pub backoff_max_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff (default: true)
    pub jitter_enabled: bool,
}

impl Default for IceRestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_initial_ms: 500,
            backoff_max_ms: 5000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl IceRestartPolicy {
    /// Validate policy parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts > 10 {
            return Err(Error::InvalidConfig(format!(
                "ice_restart.max_attempts must be at most 10, got {}",
                self.max_attempts
            )));
        }

        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(Error::InvalidConfig(format!(
                "ice_restart.backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }

        if !(self.backoff_multiplier >= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "ice_restart.backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }

        Ok(())
    }

    /// Calculate backoff duration before restart attempt `attempt` (1-indexed)
    ///
    /// Exponential in the attempt number, clamped to `backoff_max_ms`, plus
    /// up to 25% jitter when enabled.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let backoff_ms = (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(exponent);
        let backoff_ms = backoff_ms.min(self.backoff_max_ms as f64);

        let final_ms = if self.jitter_enabled && backoff_ms > 0.0 {
            backoff_ms + rand::thread_rng().gen_range(0.0..=backoff_ms * 0.25)
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Check whether restart attempt `attempt` (1-indexed) is within budget
    pub fn should_restart(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }
}
