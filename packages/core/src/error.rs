//! Error taxonomy shared by the queue client and the worker.

use thiserror::Error;

use crate::{ExecId, JobStatus};

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Bad input, reported synchronously to the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backing store could not be reached or rejected the operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A job exceeded its timeout, or a wait exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The executed function returned an error.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("retries exhausted after {retries} retries: {last_error}")]
    RetriesExhausted { retries: u32, last_error: String },

    /// A write would move a job along an edge the state machine lacks.
    #[error("job {exec_id} cannot move from {from} to {to}")]
    InvalidTransition {
        exec_id: ExecId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job not found: {0}")]
    NotFound(ExecId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
