//! Job domain types: the persisted payload, its status and its result.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::QueueError;

/// Parameters passed to a function and structured output returned by it.
///
/// Key order is preserved through serialization.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Current time as Unix epoch seconds.
pub fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Unique identifier of one job instance.
///
/// Generated ids are ULIDs; callers may also supply their own key to make
/// submission idempotent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecId(String);

impl ExecId {
    /// Create a new unique execution ID.
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Parse a caller-supplied execution ID.
    pub fn parse(s: &str) -> Result<Self, QueueError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QueueError::InvalidArgument("exec id must not be empty".into()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a job in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// No record exists. Only ever returned by queries, never stored.
    NotFound,
    #[default]
    Created,
    Queued,
    Running,
    Canceled,
    Failed,
    Complete,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    ///
    /// A stored `Failed` is always terminal: a failed attempt that still has
    /// retry budget goes straight back to `Queued`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether moving from `self` to `next` is an edge of the job state machine.
    ///
    /// A failed attempt with retry budget left is requeued straight from
    /// `Running`, so no edge leaves a terminal state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Queued, Running)
                | (Queued, Canceled)
                | (Running, Complete)
                | (Running, Failed)
                | (Running, Canceled)
                | (Running, Queued)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::NotFound => "not_found",
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Canceled => "canceled",
            JobStatus::Failed => "failed",
            JobStatus::Complete => "complete",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw return contract of an executed function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionResult {
    pub error: bool,
    pub error_message: Option<String>,
    pub function_result: Option<Params>,
}

impl FunctionResult {
    pub fn ok(output: Option<Params>) -> Self {
        Self {
            error: false,
            error_message: None,
            function_result: output,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            error: true,
            error_message: Some(message.into()),
            function_result: None,
        }
    }
}

/// Outcome record of a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub exec_id: ExecId,
    pub func_name: String,
    pub queue_name: String,
    pub success: bool,
    pub status: JobStatus,
    pub elapsed_secs: f64,
    pub started_at: Option<f64>,
    pub function_result: Option<Params>,
    /// Why the job did not succeed, if it didn't.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    /// Build the final result of `payload` with the given terminal status.
    pub fn from_payload(
        payload: &JobPayload,
        status: JobStatus,
        elapsed_secs: f64,
        outcome: FunctionResult,
    ) -> Self {
        Self {
            exec_id: payload.exec_id.clone(),
            func_name: payload.func_name.clone(),
            queue_name: payload.queue_name.clone(),
            success: status == JobStatus::Complete && !outcome.error,
            status,
            elapsed_secs,
            started_at: payload.started_at,
            function_result: outcome.function_result,
            error: outcome.error_message,
        }
    }
}

/// The persisted record for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub exec_id: ExecId,
    /// Registered function to execute.
    pub func_name: String,
    /// Upper bound on execution wall time.
    pub timeout_secs: u64,
    /// The submitter does not wait on the result.
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub params: Params,
    /// How long the record stays readable once the job is terminal.
    pub result_ttl_secs: u64,
    pub status: JobStatus,
    pub queue_name: String,
    pub enqueued_at: Option<f64>,
    pub started_at: Option<f64>,
    #[serde(default)]
    pub max_retry: u32,
    #[serde(default)]
    pub retries: u32,
    pub result: Option<JobResult>,
    /// Worker currently holding the job.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Error of the most recent failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl JobPayload {
    /// Create a new job record in the `Created` state.
    pub fn new(
        exec_id: ExecId,
        queue_name: impl Into<String>,
        func_name: impl Into<String>,
        params: Params,
    ) -> Self {
        Self {
            exec_id,
            func_name: func_name.into(),
            timeout_secs: 300, // 5 minutes default
            background: false,
            params,
            result_ttl_secs: 600,
            status: JobStatus::Created,
            queue_name: queue_name.into(),
            enqueued_at: None,
            started_at: None,
            max_retry: 0,
            retries: 0,
            result: None,
            worker_id: None,
            last_error: None,
        }
    }

    /// Set the timeout for this job.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set how long the result stays readable.
    pub fn with_result_ttl(mut self, result_ttl_secs: u64) -> Self {
        self.result_ttl_secs = result_ttl_secs;
        self
    }

    /// Set the retry budget for this job.
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether a failed attempt may be requeued.
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retry
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn encode(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(raw)?)
    }
}
