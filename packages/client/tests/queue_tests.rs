#![allow(clippy::disallowed_methods)]

use std::collections::BTreeSet;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use client::{EnqueueOptions, JobOutcome, Queue, WaitOptions, list_queues, shutdown_all};
use queue_core::{
    Command, CommandAction, ExecId, JobPayload, JobSet, JobStatus, Params, QueueError, WorkerInfo,
    keys,
};
use serde_json::json;
use store::{MemoryStore, Store};

fn params(value: serde_json::Value) -> Params {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Params::new(),
    }
}

fn setup() -> (Arc<dyn Store>, Queue) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let queue = Queue::new("default", store.clone()).unwrap();
    (store, queue)
}

#[tokio::test]
async fn test_enqueue_writes_payload_and_pending_list() -> Result<(), Box<dyn Error>> {
    let (store, queue) = setup();

    let handle = queue
        .enqueue_with(
            "add",
            params(json!({"b": 3, "a": 2})),
            EnqueueOptions::new().timeout(5).background(),
        )
        .await?;

    assert_eq!(handle.status().await?, JobStatus::Queued);
    let payload = handle.payload().await?.ok_or("payload missing")?;
    assert_eq!(payload.func_name, "add");
    assert_eq!(payload.queue_name, "default");
    assert_eq!(payload.timeout_secs, 5);
    assert_eq!(payload.result_ttl_secs, 600);
    assert!(payload.background);
    assert!(payload.enqueued_at.is_some());
    assert_eq!(payload.started_at, None);
    // Parameter order is kept
    let names: Vec<&String> = payload.params.keys().collect();
    assert_eq!(names, ["b", "a"]);

    assert_eq!(queue.list_enqueued(0, -1).await?, vec![handle.exec_id().clone()]);
    assert!(list_queues(store.as_ref()).await?.contains("default"));

    Ok(())
}

#[tokio::test]
async fn test_enqueue_rejects_bad_input() -> Result<(), Box<dyn Error>> {
    let (store, queue) = setup();

    let empty = queue.enqueue("", Params::new()).await;
    assert!(matches!(empty, Err(QueueError::InvalidArgument(_))));

    let zero = queue
        .enqueue_with("add", Params::new(), EnqueueOptions::new().timeout(0))
        .await;
    assert!(matches!(zero, Err(QueueError::InvalidArgument(_))));

    assert!(matches!(
        Queue::new(" ", store.clone()),
        Err(QueueError::InvalidArgument(_))
    ));

    // Nothing was written
    assert!(list_queues(store.as_ref()).await?.is_empty());
    assert_eq!(queue.stats().await?.pending, 0);

    Ok(())
}

#[tokio::test]
async fn test_fifo_order() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = setup();

    let mut submitted = Vec::new();
    for i in 0..5 {
        let handle = queue.enqueue("echo", params(json!({"i": i}))).await?;
        submitted.push(handle.exec_id().clone());
    }

    assert_eq!(queue.list_enqueued(0, -1).await?, submitted);
    assert_eq!(queue.list_enqueued(1, 2).await?, submitted[1..=2].to_vec());
    assert_eq!(queue.list_enqueued(-1, -1).await?, submitted[4..].to_vec());

    Ok(())
}

#[tokio::test]
async fn test_generated_ids_are_unique() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = setup();

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            queue.enqueue("echo", Params::new()).await
        }));
    }

    let mut ids = BTreeSet::new();
    for task in tasks {
        ids.insert(task.await??.exec_id().clone());
    }
    assert_eq!(ids.len(), 50);
    assert_eq!(queue.stats().await?.pending, 50);

    Ok(())
}

#[tokio::test]
async fn test_caller_exec_id_is_idempotent() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = setup();
    let exec_id = ExecId::parse("order-42")?;

    let first = queue
        .enqueue_with(
            "echo",
            Params::new(),
            EnqueueOptions::new().exec_id(exec_id.clone()),
        )
        .await?;
    let second = queue
        .enqueue_with(
            "echo",
            Params::new(),
            EnqueueOptions::new().exec_id(exec_id.clone()),
        )
        .await?;

    assert_eq!(first.exec_id(), &exec_id);
    assert_eq!(second.exec_id(), &exec_id);
    assert_eq!(queue.list_enqueued(0, -1).await?, vec![exec_id]);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resubmission_pushes_once() -> Result<(), Box<dyn Error>> {
    let (store, queue) = setup();
    let exec_id = ExecId::parse("order-42")?;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let queue = queue.clone();
        let exec_id = exec_id.clone();
        tasks.push(tokio::spawn(async move {
            queue
                .enqueue_with(
                    "echo",
                    params(json!({"attempt": i})),
                    EnqueueOptions::new().exec_id(exec_id),
                )
                .await
        }));
    }
    for task in tasks {
        assert_eq!(task.await??.exec_id(), &exec_id);
    }

    assert_eq!(queue.list_enqueued(0, -1).await?, vec![exec_id.clone()]);
    assert_eq!(store.llen(&keys::queue_jobs("default")).await?, 1);
    let payload = queue.job(exec_id).payload().await?.ok_or("payload missing")?;
    assert_eq!(payload.status, JobStatus::Queued);

    Ok(())
}

#[tokio::test]
async fn test_unknown_job() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = setup();
    let handle = queue.job(ExecId::new());

    assert_eq!(handle.status().await?, JobStatus::NotFound);
    assert_eq!(handle.result(None).await?, JobOutcome::NotFound);
    assert!(!handle.cancel().await?);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_result_wait_times_out() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = setup();
    let handle = queue.enqueue("echo", Params::new()).await?;

    assert_eq!(
        handle.result(None).await?,
        JobOutcome::Pending(JobStatus::Queued)
    );

    let waited = handle
        .result(Some(
            WaitOptions::new(Duration::from_secs(2))
                .with_poll_interval(Duration::from_millis(250)),
        ))
        .await;
    assert!(matches!(waited, Err(QueueError::Timeout(_))));

    Ok(())
}

#[tokio::test]
async fn test_result_wait_sees_terminal_write() -> Result<(), Box<dyn Error>> {
    let (store, queue) = setup();
    let handle = queue.enqueue("echo", Params::new()).await?;

    // Play the worker: finish the job shortly after the submitter starts waiting
    let key = keys::job(handle.exec_id());
    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let raw = store.get(&key).await?.unwrap_or_default();
            let mut payload = JobPayload::decode(&raw)?;
            payload.status = JobStatus::Complete;
            store.set(&key, &payload.encode()?, None).await?;
            Ok::<_, QueueError>(())
        })
    };

    let outcome = handle
        .result(Some(
            WaitOptions::new(Duration::from_secs(5)).with_poll_interval(Duration::from_millis(10)),
        ))
        .await?;
    writer.await??;

    let result = outcome.into_result().ok_or("expected a result")?;
    assert_eq!(result.status, JobStatus::Complete);
    assert!(result.success);

    Ok(())
}

#[tokio::test]
async fn test_cancel_before_claim() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = setup();
    let keep = queue.enqueue("echo", Params::new()).await?;
    let handle = queue.enqueue("echo", Params::new()).await?;

    assert!(handle.cancel().await?);
    assert_eq!(handle.status().await?, JobStatus::Canceled);
    assert_eq!(queue.list_enqueued(0, -1).await?, vec![keep.exec_id().clone()]);
    assert!(queue.members(JobSet::Cancelled).await?.contains(handle.exec_id().as_str()));
    assert!(queue.members(JobSet::Running).await?.is_empty());

    let result = handle.result(None).await?.into_result().ok_or("expected a result")?;
    assert_eq!(result.status, JobStatus::Canceled);
    assert!(!result.success);

    // Terminal jobs cannot be cancelled again
    assert!(!handle.cancel().await?);

    Ok(())
}

#[tokio::test]
async fn test_cancel_after_pop_leaves_marker_and_publishes() -> Result<(), Box<dyn Error>> {
    let (store, queue) = setup();
    let handle = queue.enqueue("echo", Params::new()).await?;
    let mut commands = store.subscribe(keys::COMMAND_CHANNEL).await?;

    // A worker popped the id but has not marked it running yet
    store.lpop(&keys::queue_jobs("default")).await?;

    assert!(handle.cancel().await?);
    assert!(store.exists(&keys::cancel_marker(handle.exec_id())).await?);
    assert_eq!(handle.status().await?, JobStatus::Queued);

    let raw = commands.next().await.ok_or("no command published")?;
    let command = Command::decode(&raw)?;
    assert_eq!(command.action, CommandAction::Cancel);
    assert_eq!(command.key, handle.exec_id().as_str());

    Ok(())
}

#[tokio::test]
async fn test_stats_and_members() -> Result<(), Box<dyn Error>> {
    let (store, queue) = setup();
    queue.enqueue("echo", Params::new()).await?;
    queue.enqueue("echo", Params::new()).await?;
    store.sadd(&JobSet::Complete.key("default"), "a").await?;
    store.sadd(&JobSet::Complete.key("default"), "b").await?;
    store.sadd(&JobSet::Failed.key("default"), "c").await?;
    store.sadd(&JobSet::Running.key("default"), "d").await?;
    store.sadd(&keys::queue_workers("default"), "w1").await?;

    let stats = queue.stats().await?;
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.complete, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.cancelled, 0);
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.active(), 3);

    assert_eq!(queue.members(JobSet::Failed).await?, BTreeSet::from(["c".to_string()]));

    Ok(())
}

#[tokio::test]
async fn test_worker_handles() -> Result<(), Box<dyn Error>> {
    let (store, queue) = setup();

    let ghost = queue.get_worker("ghost");
    assert_eq!(ghost.id(), "ghost");
    assert!(!ghost.is_alive().await?);
    assert_eq!(ghost.info().await?, None);

    let info = WorkerInfo::new("w1", ["default".to_string()]);
    store.set(&keys::worker("w1"), &info.encode()?, None).await?;
    store.sadd(&keys::queue_workers("default"), "w1").await?;

    assert_eq!(queue.list_workers().await?, BTreeSet::from(["w1".to_string()]));
    let worker = queue.get_worker("w1");
    assert!(worker.is_alive().await?);
    assert_eq!(worker.info().await?, Some(info));

    let mut commands = store.subscribe(keys::COMMAND_CHANNEL).await?;
    assert_eq!(worker.shutdown().await?, 1);
    assert_eq!(shutdown_all(store.as_ref()).await?, 1);

    let first = Command::decode(&commands.next().await.ok_or("missing")?)?;
    assert_eq!(first, Command::shutdown("w1"));
    let second = Command::decode(&commands.next().await.ok_or("missing")?)?;
    assert_eq!(second, Command::shutdown_all());

    Ok(())
}
