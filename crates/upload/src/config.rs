use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_SIZE, RetryPolicy, UploadError};

/// Tunables of an upload session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Bytes per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Maximum inputs per compose call. Clamped to the store's own limit.
    #[serde(default = "default_compose_limit")]
    pub compose_limit: usize,

    /// Attempts per chunk or compose, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff cap, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Size of the buffer used when streaming the source.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_compose_limit() -> usize {
    snapvault_store::DEFAULT_COMPOSE_LIMIT
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            compose_limit: default_compose_limit(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_true(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl UploadConfig {
    /// Rejects settings the session cannot run with.
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::Config("chunk_size must be positive".into()));
        }
        // After the first compose the destination occupies one input slot.
        if self.compose_limit < 2 {
            return Err(UploadError::Config(format!(
                "compose_limit must be at least 2, got {}",
                self.compose_limit
            )));
        }
        if self.max_attempts == 0 {
            return Err(UploadError::Config("max_attempts must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(UploadError::Config("buffer_size must be positive".into()));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(UploadError::Config(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }

    /// Retry policy described by this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            backoff_factor: self.backoff_factor,
            jitter: self.jitter,
        }
    }
}
