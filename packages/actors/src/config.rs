//! Worker configuration.

use std::time::Duration;

use queue_core::{QueueConfig, QueueError, WILDCARD, validate_queue_name};

/// Configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker id, a fresh ULID unless set.
    pub worker_id: String,
    /// Queues to serve, polled in rotating order.
    pub queues: Vec<String>,
    /// Upper bound on concurrently running jobs.
    pub max_jobs: usize,
    /// How long one blocking pop waits for work.
    pub poll_timeout: Duration,
    /// How often the presence record is refreshed.
    pub heartbeat_interval: Duration,
    /// Expiry of the presence record. A worker silent for this long is presumed dead.
    pub presence_ttl: Duration,
    /// How often running sets are scanned for orphaned jobs. `None` disables the reaper.
    pub reap_interval: Option<Duration>,
    /// Bounds of the exponential backoff applied when polling hits store errors.
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Expiry of records of claimed and requeued jobs.
    pub pending_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: ulid::Ulid::new().to_string(),
            queues: vec!["default".to_string()],
            max_jobs: 10,
            poll_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            presence_ttl: Duration::from_secs(30),
            reap_interval: Some(Duration::from_secs(30)),
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
            pending_ttl: Duration::from_secs(QueueConfig::default().pending_ttl_secs),
        }
    }
}

impl WorkerConfig {
    /// Worker serving the given queues with default settings.
    pub fn new<Q: Into<String>>(queues: impl IntoIterator<Item = Q>) -> Self {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_presence_ttl(mut self, ttl: Duration) -> Self {
        self.presence_ttl = ttl;
        self
    }

    pub fn with_reap_interval(mut self, interval: Option<Duration>) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max;
        self
    }

    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.worker_id.trim().is_empty() || self.worker_id == WILDCARD {
            return Err(QueueError::InvalidArgument(format!(
                "invalid worker id: {:?}",
                self.worker_id
            )));
        }
        if self.queues.is_empty() {
            return Err(QueueError::InvalidArgument(
                "a worker must serve at least one queue".into(),
            ));
        }
        for queue in &self.queues {
            validate_queue_name(queue)?;
        }
        if self.max_jobs == 0 {
            return Err(QueueError::InvalidArgument("max_jobs must be positive".into()));
        }
        if self.heartbeat_interval >= self.presence_ttl {
            return Err(QueueError::InvalidArgument(
                "heartbeat_interval must be shorter than presence_ttl".into(),
            ));
        }
        Ok(())
    }
}
