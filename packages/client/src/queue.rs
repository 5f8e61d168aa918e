use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use queue_core::{
    ExecId, JobPayload, JobSet, JobStatus, Params, QueueConfig, QueueError, QueueStats, epoch_now,
    keys, validate_queue_name,
};
use store::{Batch, Store};

use crate::{JobHandle, WorkerHandle};

/// Per-job overrides of the queue defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub timeout_secs: Option<u64>,
    pub result_ttl_secs: Option<u64>,
    pub max_retry: Option<u32>,
    pub background: bool,
    /// Caller-supplied idempotency key.
    pub exec_id: Option<ExecId>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn result_ttl(mut self, secs: u64) -> Self {
        self.result_ttl_secs = Some(secs);
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn exec_id(mut self, exec_id: ExecId) -> Self {
        self.exec_id = Some(exec_id);
        self
    }
}

/// Client handle to one named queue.
#[derive(Clone)]
pub struct Queue {
    name: String,
    store: Arc<dyn Store>,
    config: QueueConfig,
}

impl Queue {
    pub fn new(name: impl Into<String>, store: Arc<dyn Store>) -> Result<Self, QueueError> {
        Self::with_config(name, store, QueueConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        store: Arc<dyn Store>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        let name = name.into();
        validate_queue_name(&name)?;
        Ok(Self {
            name,
            store,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Submit a job with the queue's default options.
    pub async fn enqueue(&self, func_name: &str, params: Params) -> Result<JobHandle, QueueError> {
        self.enqueue_with(func_name, params, EnqueueOptions::default())
            .await
    }

    /// Submit a job.
    ///
    /// The payload write, the queue registration and the push onto the
    /// pending list commit together or not at all, and only if no record
    /// exists under the `exec_id`. Re-submitting an `exec_id` whose record
    /// still exists returns its handle unchanged.
    pub async fn enqueue_with(
        &self,
        func_name: &str,
        params: Params,
        options: EnqueueOptions,
    ) -> Result<JobHandle, QueueError> {
        if func_name.trim().is_empty() {
            return Err(QueueError::InvalidArgument(
                "func_name must not be empty".into(),
            ));
        }
        let timeout_secs = options
            .timeout_secs
            .unwrap_or(self.config.default_timeout_secs);
        if timeout_secs == 0 {
            return Err(QueueError::InvalidArgument(
                "timeout_secs must be positive".into(),
            ));
        }

        let exec_id = options.exec_id.unwrap_or_default();

        let mut payload = JobPayload::new(exec_id.clone(), &self.name, func_name, params)
            .with_timeout(timeout_secs)
            .with_result_ttl(
                options
                    .result_ttl_secs
                    .unwrap_or(self.config.default_result_ttl_secs),
            )
            .with_max_retry(options.max_retry.unwrap_or(self.config.default_max_retry))
            .with_background(options.background);
        payload.status = JobStatus::Queued;
        payload.enqueued_at = Some(epoch_now());

        let mut batch = Batch::new();
        batch
            .sadd(keys::QUEUES, &self.name)
            .set(
                keys::job(&exec_id),
                payload.encode()?,
                Some(self.pending_ttl()),
            )
            .rpush(keys::queue_jobs(&self.name), exec_id.as_str());
        let job_key = keys::job(&exec_id);
        if !self.store.execute_if_absent(&job_key, batch).await? {
            tracing::debug!("Job {} already submitted, reusing it", exec_id);
            return Ok(self.job(exec_id));
        }

        tracing::debug!("Enqueued job {} ({}) on {}", exec_id, func_name, self.name);
        Ok(self.job(exec_id))
    }

    /// Pending ids between `start` and `end`, both inclusive; negative
    /// indices count from the tail.
    pub async fn list_enqueued(
        &self,
        start: isize,
        end: isize,
    ) -> Result<Vec<ExecId>, QueueError> {
        self.store
            .lrange(&keys::queue_jobs(&self.name), start, end)
            .await?
            .iter()
            .map(|id| ExecId::parse(id))
            .collect()
    }

    /// Ids of the workers registered against this queue.
    pub async fn list_workers(&self) -> Result<BTreeSet<String>, QueueError> {
        Ok(self.store.smembers(&keys::queue_workers(&self.name)).await?)
    }

    /// Reference to a worker. The worker may no longer exist.
    pub fn get_worker(&self, worker_id: impl Into<String>) -> WorkerHandle {
        WorkerHandle::new(worker_id, self.store.clone())
    }

    /// Handle to a job submitted through this queue.
    pub fn job(&self, exec_id: ExecId) -> JobHandle {
        JobHandle::new(exec_id, self.store.clone()).with_pending_ttl(self.pending_ttl())
    }

    /// Ids in one of the queue's running or terminal sets.
    pub async fn members(&self, set: JobSet) -> Result<BTreeSet<String>, QueueError> {
        Ok(self.store.smembers(&set.key(&self.name)).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let count = |set: JobSet| {
            let key = set.key(&self.name);
            async move { self.store.scard(&key).await.map(|n| n as u64) }
        };
        Ok(QueueStats {
            pending: self.store.llen(&keys::queue_jobs(&self.name)).await? as u64,
            running: count(JobSet::Running).await?,
            complete: count(JobSet::Complete).await?,
            failed: count(JobSet::Failed).await?,
            cancelled: count(JobSet::Cancelled).await?,
            workers: self.store.scard(&keys::queue_workers(&self.name)).await? as u64,
        })
    }

    fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.config.pending_ttl_secs)
    }
}

/// Every queue a job was ever submitted to.
pub async fn list_queues(store: &dyn Store) -> Result<BTreeSet<String>, QueueError> {
    Ok(store.smembers(keys::QUEUES).await?)
}
