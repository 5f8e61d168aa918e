//! Queue-level configuration and statistics.

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Validate a queue name before it is used to build store keys.
pub fn validate_queue_name(name: &str) -> Result<(), QueueError> {
    if name.trim().is_empty() {
        return Err(QueueError::InvalidArgument("queue name must not be empty".into()));
    }
    if name.contains(char::is_whitespace) {
        return Err(QueueError::InvalidArgument(format!(
            "queue name must not contain whitespace: {name:?}"
        )));
    }
    Ok(())
}

/// Defaults applied to jobs submitted through a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Default timeout for jobs in this queue (seconds).
    pub default_timeout_secs: u64,
    /// Default time a finished job's record stays readable (seconds).
    pub default_result_ttl_secs: u64,
    /// Default max retries for jobs in this queue.
    pub default_max_retry: u32,
    /// TTL of a job record that has not reached a terminal state (seconds).
    pub pending_ttl_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            default_result_ttl_secs: 600,
            default_max_retry: 0,
            pending_ttl_secs: 86_400,
        }
    }
}

impl QueueConfig {
    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    pub fn with_default_result_ttl(mut self, secs: u64) -> Self {
        self.default_result_ttl_secs = secs;
        self
    }

    pub fn with_default_max_retry(mut self, max_retry: u32) -> Self {
        self.default_max_retry = max_retry;
        self
    }

    pub fn with_pending_ttl(mut self, secs: u64) -> Self {
        self.pending_ttl_secs = secs;
        self
    }
}

/// Snapshot of a queue's membership counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    /// Number of ids waiting in the pending list.
    pub pending: u64,
    /// Number of claimed jobs.
    pub running: u64,
    pub complete: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Number of workers serving this queue.
    pub workers: u64,
}

impl QueueStats {
    /// Total jobs in queue (pending + running).
    pub fn active(&self) -> u64 {
        self.pending + self.running
    }
}
