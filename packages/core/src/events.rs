//! Event types for in-process observers of a worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ExecId;

/// Events emitted by a worker as jobs move through their lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    // Job events
    /// A worker claimed a job and started executing it.
    JobStarted {
        exec_id: ExecId,
        queue: String,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A job completed successfully.
    JobCompleted {
        exec_id: ExecId,
        queue: String,
        elapsed_secs: f64,
        timestamp: DateTime<Utc>,
    },
    /// A job attempt failed.
    JobFailed {
        exec_id: ExecId,
        queue: String,
        error: String,
        retries: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// A job was cancelled, before or during execution.
    JobCancelled {
        exec_id: ExecId,
        queue: String,
        timestamp: DateTime<Utc>,
    },
    /// A job whose owner disappeared was put back on its queue.
    JobRecovered {
        exec_id: ExecId,
        queue: String,
        lost_worker: Option<String>,
        timestamp: DateTime<Utc>,
    },

    // Worker events
    /// A worker registered its presence.
    WorkerRegistered {
        worker_id: String,
        queues: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// A worker refreshed its presence record.
    WorkerHeartbeat {
        worker_id: String,
        running: u64,
        timestamp: DateTime<Utc>,
    },
    /// A worker removed its presence record and stopped.
    WorkerStopped {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobStarted { timestamp, .. } => *timestamp,
            JobEvent::JobCompleted { timestamp, .. } => *timestamp,
            JobEvent::JobFailed { timestamp, .. } => *timestamp,
            JobEvent::JobCancelled { timestamp, .. } => *timestamp,
            JobEvent::JobRecovered { timestamp, .. } => *timestamp,
            JobEvent::WorkerRegistered { timestamp, .. } => *timestamp,
            JobEvent::WorkerHeartbeat { timestamp, .. } => *timestamp,
            JobEvent::WorkerStopped { timestamp, .. } => *timestamp,
        }
    }

    /// Get the execution ID associated with this event, if any.
    pub fn exec_id(&self) -> Option<&ExecId> {
        match self {
            JobEvent::JobStarted { exec_id, .. }
            | JobEvent::JobCompleted { exec_id, .. }
            | JobEvent::JobFailed { exec_id, .. }
            | JobEvent::JobCancelled { exec_id, .. }
            | JobEvent::JobRecovered { exec_id, .. } => Some(exec_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobStarted {
                exec_id, worker_id, ..
            } => format!("Job {} started by {}", exec_id, worker_id),
            JobEvent::JobCompleted {
                exec_id,
                elapsed_secs,
                ..
            } => format!("Job {} completed in {:.3}s", exec_id, elapsed_secs),
            JobEvent::JobFailed {
                exec_id,
                error,
                will_retry,
                ..
            } => {
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!("Job {} failed: {}{}", exec_id, error, retry)
            }
            JobEvent::JobCancelled { exec_id, .. } => format!("Job {} cancelled", exec_id),
            JobEvent::JobRecovered {
                exec_id,
                lost_worker,
                ..
            } => format!(
                "Job {} recovered from {}",
                exec_id,
                lost_worker.as_deref().unwrap_or("unknown worker")
            ),
            JobEvent::WorkerRegistered {
                worker_id, queues, ..
            } => format!("Worker {} serving {}", worker_id, queues.join(",")),
            JobEvent::WorkerHeartbeat {
                worker_id, running, ..
            } => format!("Worker {} heartbeat ({} running)", worker_id, running),
            JobEvent::WorkerStopped { worker_id, .. } => format!("Worker {} stopped", worker_id),
        }
    }
}
