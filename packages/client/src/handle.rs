use std::sync::Arc;
use std::time::Duration;

use queue_core::{
    Command, ExecId, FunctionResult, JobPayload, JobResult, JobSet, JobStatus, QueueConfig,
    QueueError, keys,
};
use store::{Batch, Store};
use tokio::time::Instant;

/// How long [`JobHandle::result`] may wait for a terminal status.
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub deadline: Duration,
    pub poll_interval: Duration,
}

impl WaitOptions {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// What a result lookup found.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The job reached a terminal status.
    Ready(JobResult),
    /// The job exists but has not finished yet.
    Pending(JobStatus),
    /// No record exists, or it has expired.
    NotFound,
}

impl JobOutcome {
    pub fn into_result(self) -> Option<JobResult> {
        match self {
            JobOutcome::Ready(result) => Some(result),
            _ => None,
        }
    }
}

/// Submitter-side view of one job.
#[derive(Clone)]
pub struct JobHandle {
    exec_id: ExecId,
    store: Arc<dyn Store>,
    pending_ttl: Duration,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    pub fn new(exec_id: ExecId, store: Arc<dyn Store>) -> Self {
        Self {
            exec_id,
            store,
            pending_ttl: Duration::from_secs(QueueConfig::default().pending_ttl_secs),
        }
    }

    /// Lifetime of the cancel marker left for a worker that already popped the job.
    pub fn with_pending_ttl(mut self, pending_ttl: Duration) -> Self {
        self.pending_ttl = pending_ttl;
        self
    }

    pub fn exec_id(&self) -> &ExecId {
        &self.exec_id
    }

    /// The stored job record, if it still exists.
    pub async fn payload(&self) -> Result<Option<JobPayload>, QueueError> {
        match self.store.get(&keys::job(&self.exec_id)).await? {
            Some(raw) => Ok(Some(JobPayload::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn status(&self) -> Result<JobStatus, QueueError> {
        Ok(self
            .payload()
            .await?
            .map_or(JobStatus::NotFound, |payload| payload.status))
    }

    /// Look up the job's result.
    ///
    /// Without `wait` this answers immediately. With it, the record is polled
    /// until it reaches a terminal status, fails with [`QueueError::Timeout`]
    /// once the deadline passes, or reports `NotFound` if the record vanishes.
    pub async fn result(&self, wait: Option<WaitOptions>) -> Result<JobOutcome, QueueError> {
        let Some(wait) = wait else {
            return self.lookup().await;
        };

        let deadline = Instant::now() + wait.deadline;
        loop {
            match self.lookup().await? {
                JobOutcome::Pending(_) => {}
                outcome => return Ok(outcome),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(QueueError::Timeout(format!(
                    "job {} did not finish within {:?}",
                    self.exec_id, wait.deadline
                )));
            }
            tokio::time::sleep(wait.poll_interval.min(deadline - now)).await;
        }
    }

    async fn lookup(&self) -> Result<JobOutcome, QueueError> {
        let Some(mut payload) = self.payload().await? else {
            return Ok(JobOutcome::NotFound);
        };
        if !payload.is_terminal() {
            return Ok(JobOutcome::Pending(payload.status));
        }
        let status = payload.status;
        let result = match payload.result.take() {
            Some(result) => result,
            None => JobResult::from_payload(&payload, status, 0.0, FunctionResult::ok(None)),
        };
        Ok(JobOutcome::Ready(result))
    }

    /// Request cancellation.
    ///
    /// A job still waiting in its queue is pulled out and marked `Canceled`
    /// right away. Otherwise a cancel marker is left for whichever worker
    /// claims it and a cancel command is published for the worker running
    /// it; that request may lose the race against normal completion.
    /// Returns `false` when the job is unknown or already terminal.
    pub async fn cancel(&self) -> Result<bool, QueueError> {
        let Some(mut payload) = self.payload().await? else {
            return Ok(false);
        };
        if payload.is_terminal() {
            return Ok(false);
        }

        let pending_key = keys::queue_jobs(&payload.queue_name);
        if payload.status == JobStatus::Queued
            && self.store.lrem(&pending_key, self.exec_id.as_str()).await? > 0
        {
            payload.status = JobStatus::Canceled;
            payload.result = Some(JobResult::from_payload(
                &payload,
                JobStatus::Canceled,
                0.0,
                FunctionResult::err("cancelled before start"),
            ));
            let mut batch = Batch::new();
            batch
                .set(
                    keys::job(&self.exec_id),
                    payload.encode()?,
                    Some(Duration::from_secs(payload.result_ttl_secs)),
                )
                .sadd(JobSet::Cancelled.key(&payload.queue_name), self.exec_id.as_str());
            self.store.execute(batch).await?;
            tracing::info!("Job {} cancelled before it was claimed", self.exec_id);
            return Ok(true);
        }

        self.store
            .set(
                &keys::cancel_marker(&self.exec_id),
                "1",
                Some(self.pending_ttl),
            )
            .await?;
        let receivers = self
            .store
            .publish(keys::COMMAND_CHANNEL, &Command::cancel(&self.exec_id).encode()?)
            .await?;
        tracing::debug!(
            "Cancel request for {} reached {} subscribers",
            self.exec_id,
            receivers
        );
        Ok(true)
    }
}
