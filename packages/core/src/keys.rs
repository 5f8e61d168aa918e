//! Literal store keys for the queue namespace.

use crate::ExecId;

/// Set of every queue name that ever received a job.
pub const QUEUES: &str = "queues";

/// Set of every registered worker id.
pub const WORKERS: &str = "workers";

/// Pub/sub channel carrying serialized commands.
pub const COMMAND_CHANNEL: &str = "queue:commands";

const JOB_PREFIX: &str = "job::";
const CANCEL_PREFIX: &str = "job:cancel::";
const WORKER_PREFIX: &str = "worker::";
const QUEUE_JOBS_PREFIX: &str = "queue:jobs::";

pub fn job(exec_id: &ExecId) -> String {
    format!("{JOB_PREFIX}{exec_id}")
}

/// Marker left by a cancel request that could not remove a pending job itself.
pub fn cancel_marker(exec_id: &ExecId) -> String {
    format!("{CANCEL_PREFIX}{exec_id}")
}

pub fn worker(worker_id: &str) -> String {
    format!("{WORKER_PREFIX}{worker_id}")
}

/// FIFO list of pending execution ids.
pub fn queue_jobs(queue: &str) -> String {
    format!("{QUEUE_JOBS_PREFIX}{queue}")
}

pub fn queue_workers(queue: &str) -> String {
    format!("queue:workers::{queue}")
}

/// Recover the queue name from a pending-list key.
pub fn queue_from_jobs_key(key: &str) -> Option<&str> {
    key.strip_prefix(QUEUE_JOBS_PREFIX)
}

/// Per-queue sets tracking where each claimed job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobSet {
    Running,
    Cancelled,
    Failed,
    Complete,
}

impl JobSet {
    pub fn key(self, queue: &str) -> String {
        let name = match self {
            JobSet::Running => "running",
            JobSet::Cancelled => "cancelled",
            JobSet::Failed => "failed",
            JobSet::Complete => "complete",
        };
        format!("queue:{name}::{queue}")
    }
}
