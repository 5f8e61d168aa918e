//! Core domain types for the job queue system.
//!
//! This crate contains shared types used across all packages:
//! - JobPayload, JobResult and JobStatus for work items
//! - WorkerInfo for worker presence
//! - Command for the cancellation / control channel
//! - The literal store key namespace
//! - Events for in-process observers

mod command;
mod error;
mod events;
mod job;
pub mod keys;
mod queue;
mod worker;

pub use command::{Command, CommandAction, Visibility, WILDCARD};
pub use error::QueueError;
pub use events::JobEvent;
pub use job::{ExecId, FunctionResult, JobPayload, JobResult, JobStatus, Params, epoch_now};
pub use keys::JobSet;
pub use queue::{QueueConfig, QueueStats, validate_queue_name};
pub use worker::WorkerInfo;
