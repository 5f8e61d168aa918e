//! Store-side transitions of jobs and worker presence.
//!
//! Every transition that touches more than one key goes through a single
//! [`Batch`], so a job is never both pending and running, nor terminal and
//! still running.

use std::time::Duration;

use queue_core::{
    ExecId, FunctionResult, JobPayload, JobResult, JobSet, JobStatus, QueueError, WorkerInfo,
    epoch_now, keys,
};
use store::{Batch, Store};

use crate::execute::Attempt;

/// Write the presence record and the membership sets.
///
/// Idempotent; the heartbeat calls it again to refresh the record's expiry.
pub async fn register(
    store: &dyn Store,
    info: &WorkerInfo,
    ttl: Duration,
) -> Result<(), QueueError> {
    let mut batch = Batch::new();
    batch
        .set(keys::worker(&info.id), info.encode()?, Some(ttl))
        .sadd(keys::WORKERS, &info.id);
    for queue in &info.queues {
        batch.sadd(keys::queue_workers(queue), &info.id);
    }
    store.execute(batch).await?;
    Ok(())
}

/// Remove the presence record and every membership of the worker.
pub async fn unregister(store: &dyn Store, info: &WorkerInfo) -> Result<(), QueueError> {
    let mut batch = Batch::new();
    batch
        .delete(keys::worker(&info.id))
        .srem(keys::WORKERS, &info.id);
    for queue in &info.queues {
        batch.srem(keys::queue_workers(queue), &info.id);
    }
    store.execute(batch).await?;
    Ok(())
}

/// Result of taking ownership of a popped id.
#[derive(Debug)]
pub enum Claim {
    /// The job is now `Running` and owned by the claiming worker.
    Started(Box<JobPayload>),
    /// A cancel request was waiting; the job was finalized without running.
    Canceled(Box<JobPayload>),
    /// The record expired or is already terminal.
    Missing,
}

/// Mark a popped job as running under `worker_id`.
///
/// The pop itself already gave this worker exclusive ownership of the id.
pub async fn claim(
    store: &dyn Store,
    exec_id: &ExecId,
    worker_id: &str,
    record_ttl: Duration,
) -> Result<Claim, QueueError> {
    let Some(raw) = store.get(&keys::job(exec_id)).await? else {
        tracing::warn!("Job {} expired before it was claimed", exec_id);
        return Ok(Claim::Missing);
    };
    let mut payload = JobPayload::decode(&raw)?;
    if !payload.status.can_transition_to(JobStatus::Running) {
        tracing::debug!("Job {} is already {}, skipping", exec_id, payload.status);
        return Ok(Claim::Missing);
    }

    if store.exists(&keys::cancel_marker(exec_id)).await? {
        let mut batch = Batch::new();
        settle(
            &mut batch,
            &mut payload,
            JobStatus::Canceled,
            0.0,
            FunctionResult::err("cancelled before start"),
        )?;
        store.execute(batch).await?;
        return Ok(Claim::Canceled(Box::new(payload)));
    }

    advance(&mut payload, JobStatus::Running)?;
    payload.started_at = Some(epoch_now());
    payload.worker_id = Some(worker_id.to_string());

    let mut batch = Batch::new();
    batch
        .set(keys::job(exec_id), payload.encode()?, Some(record_ttl))
        .sadd(JobSet::Running.key(&payload.queue_name), exec_id.as_str());
    store.execute(batch).await?;
    Ok(Claim::Started(Box::new(payload)))
}

/// How a claimed job was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum Finalized {
    Completed { elapsed_secs: f64 },
    Failed { error: String, retries: u32 },
    Canceled,
    /// The attempt failed and the job went back to the tail of its queue.
    Requeued { attempt: u32, error: String },
}

/// Record the outcome of a running job.
pub async fn finalize(
    store: &dyn Store,
    mut payload: JobPayload,
    attempt: Attempt,
    elapsed_secs: f64,
    record_ttl: Duration,
) -> Result<Finalized, QueueError> {
    let mut batch = Batch::new();
    batch.srem(
        JobSet::Running.key(&payload.queue_name),
        payload.exec_id.as_str(),
    );

    let finalized = match attempt {
        Attempt::Succeeded(output) => {
            settle(
                &mut batch,
                &mut payload,
                JobStatus::Complete,
                elapsed_secs,
                FunctionResult::ok(output),
            )?;
            Finalized::Completed { elapsed_secs }
        }
        Attempt::Cancelled => {
            settle(
                &mut batch,
                &mut payload,
                JobStatus::Canceled,
                elapsed_secs,
                FunctionResult::err("cancelled"),
            )?;
            Finalized::Canceled
        }
        Attempt::UnknownFunction => {
            let error = format!("func {} not found", payload.func_name);
            payload.last_error = Some(error.clone());
            settle(
                &mut batch,
                &mut payload,
                JobStatus::Failed,
                elapsed_secs,
                FunctionResult::err(error.clone()),
            )?;
            Finalized::Failed {
                error,
                retries: payload.retries,
            }
        }
        Attempt::Failed(error) => fail_or_requeue(
            &mut batch,
            &mut payload,
            QueueError::Execution(error).to_string(),
            elapsed_secs,
            record_ttl,
        )?,
        Attempt::TimedOut(deadline) => fail_or_requeue(
            &mut batch,
            &mut payload,
            QueueError::Timeout(format!("job exceeded {}s", deadline.as_secs())).to_string(),
            elapsed_secs,
            record_ttl,
        )?,
    };

    store.execute(batch).await?;
    Ok(finalized)
}

/// An outcome the store has not accepted yet.
#[derive(Debug)]
pub struct Unrecorded {
    /// The job as it was claimed.
    pub payload: JobPayload,
    pub attempt: Attempt,
    pub elapsed_secs: f64,
    /// Why the last write failed.
    pub error: QueueError,
}

/// Retry recording an outcome the store rejected earlier.
///
/// Returns `None` when the record no longer shows the original claim, which
/// means an earlier write did land or the job moved on without this worker.
pub async fn finalize_unrecorded(
    store: &dyn Store,
    job: &Unrecorded,
    record_ttl: Duration,
) -> Result<Option<Finalized>, QueueError> {
    let Some(raw) = store.get(&keys::job(&job.payload.exec_id)).await? else {
        return Ok(None);
    };
    let stored = JobPayload::decode(&raw)?;
    if !same_claim(&stored, &job.payload) {
        return Ok(None);
    }
    let finalized = finalize(
        store,
        job.payload.clone(),
        job.attempt.clone(),
        job.elapsed_secs,
        record_ttl,
    )
    .await?;
    Ok(Some(finalized))
}

fn same_claim(stored: &JobPayload, claimed: &JobPayload) -> bool {
    stored.status == JobStatus::Running
        && stored.worker_id == claimed.worker_id
        && stored.started_at == claimed.started_at
}

/// A running job whose owner vanished.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    pub exec_id: ExecId,
    pub queue: String,
    pub lost_worker: Option<String>,
    pub outcome: Finalized,
}

/// Requeue or fail running jobs whose owning worker's presence has expired.
///
/// Removing the id from the running set decides which reaper handles it;
/// the losers skip the job.
pub async fn reap_orphans(
    store: &dyn Store,
    queues: &[String],
    record_ttl: Duration,
) -> Result<Vec<Recovered>, QueueError> {
    let mut recovered = Vec::new();
    for queue in queues {
        let running_key = JobSet::Running.key(queue);
        for id in store.smembers(&running_key).await? {
            let Ok(exec_id) = ExecId::parse(&id) else {
                store.srem(&running_key, &id).await?;
                continue;
            };
            let Some(raw) = store.get(&keys::job(&exec_id)).await? else {
                // Record expired; nothing left to recover.
                store.srem(&running_key, &id).await?;
                continue;
            };
            let payload = JobPayload::decode(&raw)?;
            let lost_worker = payload.worker_id.clone();
            if let Some(owner) = &lost_worker {
                if store.exists(&keys::worker(owner)).await? {
                    continue;
                }
            }
            if !store.srem(&running_key, &id).await? {
                continue;
            }
            // Another reaper may have requeued the job and a live worker
            // claimed it again between the read and the removal.
            let mut current = match store.get(&keys::job(&exec_id)).await? {
                Some(raw) => JobPayload::decode(&raw)?,
                None => continue,
            };
            if !same_claim(&current, &payload) {
                if current.status == JobStatus::Running {
                    store.sadd(&running_key, &id).await?;
                }
                continue;
            }

            let error = format!(
                "worker {} lost",
                lost_worker.as_deref().unwrap_or("unknown")
            );
            let mut batch = Batch::new();
            let outcome = fail_or_requeue(&mut batch, &mut current, error, 0.0, record_ttl)?;
            store.execute(batch).await?;

            tracing::info!("Recovered job {} from queue {}: {:?}", exec_id, queue, outcome);
            recovered.push(Recovered {
                exec_id,
                queue: queue.clone(),
                lost_worker,
                outcome,
            });
        }
    }
    Ok(recovered)
}

/// Move the payload to `next`, refusing edges the state machine lacks.
fn advance(payload: &mut JobPayload, next: JobStatus) -> Result<(), QueueError> {
    if !payload.status.can_transition_to(next) {
        return Err(QueueError::InvalidTransition {
            exec_id: payload.exec_id.clone(),
            from: payload.status,
            to: next,
        });
    }
    payload.status = next;
    Ok(())
}

/// Write a terminal status and result, and file the id into its terminal set.
fn settle(
    batch: &mut Batch,
    payload: &mut JobPayload,
    status: JobStatus,
    elapsed_secs: f64,
    outcome: FunctionResult,
) -> Result<(), QueueError> {
    let set = match status {
        JobStatus::Complete => JobSet::Complete,
        JobStatus::Canceled => JobSet::Cancelled,
        _ => JobSet::Failed,
    };
    advance(payload, status)?;
    payload.result = Some(JobResult::from_payload(payload, status, elapsed_secs, outcome));
    batch
        .set(
            keys::job(&payload.exec_id),
            payload.encode()?,
            Some(Duration::from_secs(payload.result_ttl_secs)),
        )
        .sadd(set.key(&payload.queue_name), payload.exec_id.as_str())
        .delete(keys::cancel_marker(&payload.exec_id));
    Ok(())
}

/// Spend one retry on a failed attempt, or fail the job for good.
fn fail_or_requeue(
    batch: &mut Batch,
    payload: &mut JobPayload,
    error: String,
    elapsed_secs: f64,
    record_ttl: Duration,
) -> Result<Finalized, QueueError> {
    payload.last_error = Some(error.clone());

    if payload.can_retry() {
        advance(payload, JobStatus::Queued)?;
        payload.retries += 1;
        payload.started_at = None;
        payload.worker_id = None;
        batch
            .set(keys::job(&payload.exec_id), payload.encode()?, Some(record_ttl))
            .rpush(
                keys::queue_jobs(&payload.queue_name),
                payload.exec_id.as_str(),
            );
        return Ok(Finalized::Requeued {
            attempt: payload.retries,
            error,
        });
    }

    let message = if payload.max_retry > 0 {
        QueueError::RetriesExhausted {
            retries: payload.retries,
            last_error: error,
        }
        .to_string()
    } else {
        error
    };
    settle(
        batch,
        payload,
        JobStatus::Failed,
        elapsed_secs,
        FunctionResult::err(message.clone()),
    )?;
    Ok(Finalized::Failed {
        error: message,
        retries: payload.retries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_core::Params;
    use store::MemoryStore;

    const TTL: Duration = Duration::from_secs(60);

    async fn running_job(store: &MemoryStore, max_retry: u32) -> JobPayload {
        let mut payload =
            JobPayload::new(ExecId::new(), "q", "f", Params::new()).with_max_retry(max_retry);
        payload.status = JobStatus::Queued;
        store
            .set(&keys::job(&payload.exec_id), &payload.encode().unwrap(), None)
            .await
            .unwrap();
        match claim(store, &payload.exec_id, "w1", TTL).await.unwrap() {
            Claim::Started(payload) => *payload,
            other => panic!("unexpected claim: {other:?}"),
        }
    }

    async fn stored(store: &MemoryStore, exec_id: &ExecId) -> JobPayload {
        let raw = store.get(&keys::job(exec_id)).await.unwrap().unwrap();
        JobPayload::decode(&raw).unwrap()
    }

    #[tokio::test]
    async fn claim_marks_running() {
        let store = MemoryStore::new();
        let payload = running_job(&store, 0).await;
        assert_eq!(payload.status, JobStatus::Running);
        assert_eq!(payload.worker_id.as_deref(), Some("w1"));
        assert!(payload.started_at.is_some());
        assert!(
            store
                .smembers(&JobSet::Running.key("q"))
                .await
                .unwrap()
                .contains(payload.exec_id.as_str())
        );
    }

    #[tokio::test]
    async fn success_moves_to_complete() {
        let store = MemoryStore::new();
        let payload = running_job(&store, 0).await;
        let exec_id = payload.exec_id.clone();

        let mut output = Params::new();
        output.insert("sum".into(), 5.into());
        let attempt = Attempt::Succeeded(Some(output.clone()));
        let finalized = finalize(&store, payload, attempt, 0.5, TTL).await.unwrap();
        assert_eq!(finalized, Finalized::Completed { elapsed_secs: 0.5 });

        let stored = stored(&store, &exec_id).await;
        assert_eq!(stored.status, JobStatus::Complete);
        let result = stored.result.unwrap();
        assert!(result.success);
        assert_eq!(result.function_result, Some(output));
        assert_eq!(store.scard(&JobSet::Running.key("q")).await.unwrap(), 0);
        assert_eq!(store.scard(&JobSet::Complete.key("q")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failure_requeues_until_budget_is_spent() {
        let store = MemoryStore::new();
        let payload = running_job(&store, 1).await;
        let exec_id = payload.exec_id.clone();

        let first = finalize(&store, payload, Attempt::Failed("boom".into()), 0.1, TTL)
            .await
            .unwrap();
        assert_eq!(
            first,
            Finalized::Requeued {
                attempt: 1,
                error: "execution failed: boom".into()
            }
        );
        let requeued = stored(&store, &exec_id).await;
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.retries, 1);
        assert_eq!(requeued.worker_id, None);
        assert_eq!(
            store.lrange(&keys::queue_jobs("q"), 0, -1).await.unwrap(),
            vec![exec_id.to_string()]
        );

        store.lpop(&keys::queue_jobs("q")).await.unwrap();
        let Claim::Started(payload) = claim(&store, &exec_id, "w1", TTL).await.unwrap() else {
            panic!("expected a started claim");
        };
        let second = finalize(&store, *payload, Attempt::Failed("boom".into()), 0.1, TTL)
            .await
            .unwrap();
        assert_eq!(
            second,
            Finalized::Failed {
                error: "retries exhausted after 1 retries: execution failed: boom".into(),
                retries: 1
            }
        );
        let failed = stored(&store, &exec_id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(!failed.result.unwrap().success);
        assert_eq!(store.scard(&JobSet::Failed.key("q")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_function_is_not_retried() {
        let store = MemoryStore::new();
        let payload = running_job(&store, 3).await;
        let finalized = finalize(&store, payload, Attempt::UnknownFunction, 0.0, TTL)
            .await
            .unwrap();
        assert_eq!(
            finalized,
            Finalized::Failed {
                error: "func f not found".into(),
                retries: 0
            }
        );
        assert_eq!(store.llen(&keys::queue_jobs("q")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancel_marker_short_circuits_claim() {
        let store = MemoryStore::new();
        let mut payload = JobPayload::new(ExecId::new(), "q", "f", Params::new());
        payload.status = JobStatus::Queued;
        let exec_id = payload.exec_id.clone();
        store
            .set(&keys::job(&exec_id), &payload.encode().unwrap(), None)
            .await
            .unwrap();
        store
            .set(&keys::cancel_marker(&exec_id), "1", None)
            .await
            .unwrap();

        let claimed = claim(&store, &exec_id, "w1", TTL).await.unwrap();
        assert!(matches!(claimed, Claim::Canceled(_)));
        assert_eq!(stored(&store, &exec_id).await.status, JobStatus::Canceled);
        assert!(!store.exists(&keys::cancel_marker(&exec_id)).await.unwrap());
        assert_eq!(store.scard(&JobSet::Running.key("q")).await.unwrap(), 0);
        assert_eq!(store.scard(&JobSet::Cancelled.key("q")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reaper_recovers_jobs_of_dead_workers_only() {
        let store = MemoryStore::new();
        let orphan = running_job(&store, 1).await;

        let live = WorkerInfo::new("w2", ["q".to_string()]);
        register(&store, &live, TTL).await.unwrap();
        let mut owned = JobPayload::new(ExecId::new(), "q", "f", Params::new());
        owned.status = JobStatus::Queued;
        store
            .set(&keys::job(&owned.exec_id), &owned.encode().unwrap(), None)
            .await
            .unwrap();
        claim(&store, &owned.exec_id, "w2", TTL).await.unwrap();

        let queues = vec!["q".to_string()];
        let recovered = reap_orphans(&store, &queues, TTL).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].exec_id, orphan.exec_id);
        assert_eq!(recovered[0].lost_worker.as_deref(), Some("w1"));
        assert!(matches!(recovered[0].outcome, Finalized::Requeued { attempt: 1, .. }));

        let running = store.smembers(&JobSet::Running.key("q")).await.unwrap();
        assert!(running.contains(owned.exec_id.as_str()));
        assert!(!running.contains(orphan.exec_id.as_str()));

        // A second pass finds nothing to do
        assert!(reap_orphans(&store, &queues, TTL).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalizing_twice_is_refused() {
        let store = MemoryStore::new();
        let payload = running_job(&store, 0).await;
        finalize(&store, payload.clone(), Attempt::Succeeded(None), 0.1, TTL)
            .await
            .unwrap();

        let recorded = stored(&store, &payload.exec_id).await;
        let err = finalize(&store, recorded, Attempt::Cancelled, 0.1, TTL)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: JobStatus::Complete,
                to: JobStatus::Canceled,
                ..
            }
        ));
        assert_eq!(stored(&store, &payload.exec_id).await.status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn unrecorded_outcome_is_written_once() {
        let store = MemoryStore::new();
        let payload = running_job(&store, 1).await;
        let exec_id = payload.exec_id.clone();
        let job = Unrecorded {
            payload,
            attempt: Attempt::Failed("boom".into()),
            elapsed_secs: 0.2,
            error: QueueError::StoreUnavailable("outage".into()),
        };

        let first = finalize_unrecorded(&store, &job, TTL).await.unwrap();
        assert!(matches!(first, Some(Finalized::Requeued { attempt: 1, .. })));
        // The record no longer shows the claim, so nothing is pushed twice
        assert_eq!(finalize_unrecorded(&store, &job, TTL).await.unwrap(), None);
        assert_eq!(store.llen(&keys::queue_jobs("q")).await.unwrap(), 1);
        assert_eq!(stored(&store, &exec_id).await.retries, 1);
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let store = MemoryStore::new();
        let info = WorkerInfo::new("w1", ["a".to_string(), "b".to_string()]);
        register(&store, &info, TTL).await.unwrap();
        assert!(store.exists(&keys::worker("w1")).await.unwrap());
        assert!(store.smembers(keys::WORKERS).await.unwrap().contains("w1"));
        assert!(store.smembers(&keys::queue_workers("b")).await.unwrap().contains("w1"));

        unregister(&store, &info).await.unwrap();
        assert!(!store.exists(&keys::worker("w1")).await.unwrap());
        assert!(store.smembers(keys::WORKERS).await.unwrap().is_empty());
        assert!(store.smembers(&keys::queue_workers("a")).await.unwrap().is_empty());
    }
}
