//! Update engine configuration.
//!
//! Configuration is plain serde data so each platform can load it from its
//! own storage:
//! - Linux: JSON file passed on the command line
//! - ESP32: compiled-in defaults or NVS
//!
//! Defaults follow the timing of the deployed firmware: a 5 second
//! per-request deadline polled in 1 second slices, 1 second between session
//! retries and 1024-byte chunks.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::model::SizeExponent;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration data could not be parsed.
    #[error("Invalid configuration data: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field holds a value the engine cannot run with.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Settings for one update engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateConfig {
    /// Where the image is retrieved from (e.g. "coaps://fw.example.org/firmware").
    pub destination: String,

    /// Deadline for each outstanding chunk request.
    pub request_timeout_ms: u64,

    /// Longest single blocking poll on the transport.
    pub poll_slice_ms: u64,

    /// Fixed delay between session establishment attempts.
    pub session_retry_delay_ms: u64,

    /// Cap on establishment attempts. `None` retries until success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_session_attempts: Option<u32>,

    /// Size class requested for the first chunk.
    pub block_size_exponent: SizeExponent,

    /// Blocking longer than this emits a liveness signal.
    pub liveness_threshold_ms: u64,

    /// Log cadence while waiting for a new trigger after a redundant image.
    pub redundant_poll_interval_ms: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            destination: String::new(),
            request_timeout_ms: 5_000,
            poll_slice_ms: 1_000,
            session_retry_delay_ms: 1_000,
            max_session_attempts: None,
            block_size_exponent: SizeExponent::MAX,
            liveness_threshold_ms: 1_000,
            redundant_poll_interval_ms: 2_000,
        }
    }
}

impl UpdateConfig {
    /// Create a default config for the given destination.
    pub fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            ..Default::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: UpdateConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the engine can run with these values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.destination.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "destination",
                reason: "must not be empty".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "requestTimeoutMs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.poll_slice_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pollSliceMs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.redundant_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "redundantPollIntervalMs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_session_attempts == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "maxSessionAttempts",
                reason: "must allow at least one attempt".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms)
    }

    pub fn session_retry_delay(&self) -> Duration {
        Duration::from_millis(self.session_retry_delay_ms)
    }

    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_millis(self.liveness_threshold_ms)
    }

    pub fn redundant_poll_interval(&self) -> Duration {
        Duration::from_millis(self.redundant_poll_interval_ms)
    }
}
