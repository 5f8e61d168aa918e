//! Submitter-side API of the job queue.
//!
//! - [`Queue`] submits jobs into a named queue and inspects its state
//! - [`JobHandle`] polls one job's status and result, and cancels it
//! - [`WorkerHandle`] reads a worker's presence record and asks it to stop

mod handle;
mod queue;
mod worker_handle;

pub use handle::{JobHandle, JobOutcome, WaitOptions};
pub use queue::{EnqueueOptions, Queue, list_queues};
pub use worker_handle::{WorkerHandle, list_workers, shutdown_all};
