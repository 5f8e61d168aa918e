//! Worker side of the job queue, built on Ractor.
//!
//! A [`WorkerActor`] serves one or more named queues. Around it run a few
//! tasks it owns:
//!
//! - a poller popping ids from the pending lists while job slots are free
//! - a command listener forwarding cancel and shutdown requests
//! - heartbeat and reaper timers
//!
//! The poller claims each id before handing it over, so a job popped by a
//! stopping worker is left in its running set for the reaper. Each job runs
//! in its own task under its hard deadline and reports back to the actor once
//! its outcome is recorded.
//!
//! # Usage
//!
//! ```ignore
//! use actors::{JobHandlerRegistry, WorkerArgs, WorkerConfig, job_handler, start_worker};
//!
//! let mut handlers = JobHandlerRegistry::new();
//! handlers.register(job_handler!("echo", |params| Ok(Some(params))));
//!
//! let config = WorkerConfig::new(["default"]);
//! let (worker, handle) = start_worker(WorkerArgs::new(config, store, handlers)).await?;
//! ```

mod config;
mod execute;
mod handler;
pub mod lifecycle;
mod messages;
mod worker_actor;

pub use config::WorkerConfig;
pub use execute::{Attempt, execute};
pub use handler::{
    FnHandler, HandlerFuture, HandlerResult, JobHandler, JobHandlerRegistry, TypedHandler,
};
pub use lifecycle::{Claim, Finalized, Recovered, Unrecorded};
pub use messages::WorkerMessage;
pub use worker_actor::{WorkerActor, WorkerActorState, WorkerArgs, start_worker};

/// Re-exported for handler signatures and the `job_handler!` macro.
pub use queue_core::Params;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
