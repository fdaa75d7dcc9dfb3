//! Parameters governing PDP communication.

use serde::{Deserialize, Serialize};

/// Default heartbeat interval pushed to PDPs, in milliseconds.
pub const DEFAULT_HEART_BEAT_MS: u64 = 10_000;

/// Default multiplier of missed heartbeats before a PDP is dropped.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

const fn default_heart_beat_ms() -> u64 {
    DEFAULT_HEART_BEAT_MS
}

const fn default_max_missed_heartbeats() -> u32 {
    DEFAULT_MAX_MISSED_HEARTBEATS
}

const fn default_max_wait_ms() -> u64 {
    30_000
}

const fn default_max_retry_count() -> u32 {
    1
}

/// Error raised by [`PdpParameters::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ParameterError {
    /// A field holds an out-of-range value.
    #[error("invalid parameter {name}: {reason}")]
    Invalid {
        /// Offending field.
        name: &'static str,

        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Timeout and retry bounds for one request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestParameters {
    /// How long to wait for a response before timing out.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// How many times to re-publish after a timeout.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
}

impl Default for RequestParameters {
    fn default() -> Self {
        Self {
            max_wait_ms: default_max_wait_ms(),
            max_retry_count: default_max_retry_count(),
        }
    }
}

/// Parameters for communicating with PDPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdpParameters {
    /// Base heartbeat interval in milliseconds. Must be at least 1.
    #[serde(default = "default_heart_beat_ms")]
    pub heart_beat_ms: u64,

    /// Heartbeats a PDP may miss before it is presumed gone.
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,

    /// Bounds for UPDATE requests.
    #[serde(default)]
    pub update_parameters: RequestParameters,

    /// Bounds for STATE-CHANGE requests.
    #[serde(default)]
    pub state_change_parameters: RequestParameters,
}

impl Default for PdpParameters {
    fn default() -> Self {
        Self {
            heart_beat_ms: default_heart_beat_ms(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            update_parameters: RequestParameters::default(),
            state_change_parameters: RequestParameters::default(),
        }
    }
}

impl PdpParameters {
    /// Check field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ParameterError`] naming the first invalid field.
    pub const fn validate(&self) -> Result<(), ParameterError> {
        if self.heart_beat_ms < 1 {
            return Err(ParameterError::Invalid {
                name: "heart_beat_ms",
                reason: "must be at least 1",
            });
        }

        if self.max_missed_heartbeats < 1 {
            return Err(ParameterError::Invalid {
                name: "max_missed_heartbeats",
                reason: "must be at least 1",
            });
        }

        if self.update_parameters.max_wait_ms < 1 {
            return Err(ParameterError::Invalid {
                name: "update_parameters.max_wait_ms",
                reason: "must be at least 1",
            });
        }

        if self.state_change_parameters.max_wait_ms < 1 {
            return Err(ParameterError::Invalid {
                name: "state_change_parameters.max_wait_ms",
                reason: "must be at least 1",
            });
        }

        Ok(())
    }

    /// The heartbeat timeout: `max_missed_heartbeats * heart_beat_ms`.
    #[must_use]
    pub const fn heartbeat_timeout_ms(&self) -> u64 {
        self.heart_beat_ms * self.max_missed_heartbeats as u64
    }
}
