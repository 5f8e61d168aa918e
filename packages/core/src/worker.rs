//! Worker presence record.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::job::epoch_now;

/// Presence and heartbeat record of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub started_at: f64,
    /// Queue names served.
    pub queues: BTreeSet<String>,
    #[serde(default)]
    pub completed_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    #[serde(default)]
    pub cancelled_count: u64,
    #[serde(default)]
    pub running_count: u64,
    /// Maximum number of concurrently running jobs.
    #[serde(default)]
    pub max_jobs: usize,
    pub heartbeat_at: f64,
}

impl WorkerInfo {
    pub fn new(id: impl Into<String>, queues: impl IntoIterator<Item = String>) -> Self {
        let now = epoch_now();
        Self {
            id: id.into(),
            started_at: now,
            queues: queues.into_iter().collect(),
            completed_count: 0,
            failed_count: 0,
            cancelled_count: 0,
            running_count: 0,
            max_jobs: 0,
            heartbeat_at: now,
        }
    }

    pub fn encode(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(raw)?)
    }
}
