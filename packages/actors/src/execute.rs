//! Running one job attempt under its deadline.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use queue_core::{JobPayload, Params};
use tokio::sync::oneshot;

use crate::handler::JobHandler;

/// How one attempt ended, before it is recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    Succeeded(Option<Params>),
    /// The function returned an error or panicked.
    Failed(String),
    TimedOut(Duration),
    Cancelled,
    /// No handler is registered under the job's function name.
    UnknownFunction,
}

/// Invoke `handler` on the job's params.
///
/// The handler future is dropped when the job's timeout elapses or when
/// `cancel` fires, whichever comes first.
pub async fn execute(
    handler: Option<Arc<dyn JobHandler>>,
    payload: &JobPayload,
    cancel: oneshot::Receiver<()>,
) -> Attempt {
    let Some(handler) = handler else {
        return Attempt::UnknownFunction;
    };
    let deadline = payload.timeout();
    let run = AssertUnwindSafe(handler.call(payload.params.clone())).catch_unwind();

    tokio::select! {
        finished = tokio::time::timeout(deadline, run) => match finished {
            Ok(Ok(Ok(output))) => Attempt::Succeeded(output),
            Ok(Ok(Err(error))) => Attempt::Failed(error),
            Ok(Err(panic)) => Attempt::Failed(panic_message(panic)),
            Err(_) => Attempt::TimedOut(deadline),
        },
        Ok(()) = cancel => Attempt::Cancelled,
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {detail}")
}
