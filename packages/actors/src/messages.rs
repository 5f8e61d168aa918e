//! Message types for actor communication.

use queue_core::{Command, ExecId, JobPayload, WorkerInfo};
use ractor::RpcReplyPort;
use tokio::sync::OwnedSemaphorePermit;

use crate::lifecycle::{Finalized, Unrecorded};

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// The poller claimed a job. The permit holds one of the worker's job slots.
    Dispatch {
        payload: Box<JobPayload>,
        permit: OwnedSemaphorePermit,
    },

    /// The poller popped a job with a pending cancel request and settled it.
    CancelledBeforeStart { exec_id: ExecId, queue: String },

    /// A job task finished, with its outcome recorded or still to record.
    Finished {
        exec_id: ExecId,
        queue: String,
        outcome: Result<Finalized, Box<Unrecorded>>,
    },

    /// A command arrived on the command channel.
    Command(Command),

    /// Refresh the presence record.
    Heartbeat,

    /// Scan for jobs orphaned by dead workers.
    Reap,

    /// Get the worker's current presence record.
    GetInfo { reply: RpcReplyPort<WorkerInfo> },

    /// Shutdown the worker.
    Shutdown,
}
