//! Worker actor for executing jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use queue_core::{
    Command, CommandAction, ExecId, JobEvent, JobPayload, QueueError, WILDCARD, WorkerInfo,
    epoch_now, keys,
};
use ractor::{Actor, ActorProcessingErr, ActorRef, SpawnErr};
use store::{Store, StoreError, Subscription};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;

use crate::config::WorkerConfig;
use crate::execute::execute;
use crate::handler::JobHandlerRegistry;
use crate::lifecycle::{self, Claim, Finalized, Unrecorded};
use crate::messages::WorkerMessage;

/// How long a stopping worker waits for its poller beyond one poll timeout.
const POLLER_GRACE: Duration = Duration::from_secs(1);

/// A job currently executing on this worker.
struct RunningJob {
    queue: String,
    /// Taken once a cancel request has been forwarded.
    cancel: Option<oneshot::Sender<()>>,
    task: AbortHandle,
}

/// State for the worker actor.
pub struct WorkerActorState {
    /// Presence record, published on every heartbeat.
    pub info: WorkerInfo,
    config: WorkerConfig,
    store: Arc<dyn Store>,
    handlers: Arc<JobHandlerRegistry>,
    event_tx: Option<broadcast::Sender<JobEvent>>,
    running: HashMap<String, RunningJob>,
    /// Outcomes to write again on the next heartbeat.
    unrecorded: Vec<Unrecorded>,
    poller: Option<JoinHandle<()>>,
    stop_poller: watch::Sender<bool>,
    /// Command listener and timers.
    background: Vec<JoinHandle<()>>,
}

impl WorkerActorState {
    fn emit(&self, event: JobEvent) {
        tracing::debug!("{}", event.description());
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn sync_running(&mut self) {
        self.info.running_count = self.running.len() as u64;
    }

    async fn publish_presence(&mut self) {
        self.info.heartbeat_at = epoch_now();
        if let Err(e) =
            lifecycle::register(self.store.as_ref(), &self.info, self.config.presence_ttl).await
        {
            tracing::warn!("Worker {} failed to refresh its presence: {}", self.info.id, e);
        }
    }

    /// Let the poller finish its current pop and claim, then wait for it.
    async fn stop_polling(&mut self) {
        let _ = self.stop_poller.send(true);
        let Some(mut poller) = self.poller.take() else {
            return;
        };
        let grace = self.config.poll_timeout + POLLER_GRACE;
        if tokio::time::timeout(grace, &mut poller).await.is_err() {
            tracing::warn!("Poller of worker {} did not stop in time", self.info.id);
            poller.abort();
        }
    }

    fn start_job(
        &mut self,
        myself: &ActorRef<WorkerMessage>,
        payload: JobPayload,
        permit: OwnedSemaphorePermit,
    ) {
        let exec_id = payload.exec_id.clone();
        let queue = payload.queue_name.clone();
        let handler = self.handlers.get(&payload.func_name);
        let store = self.store.clone();
        let record_ttl = self.config.pending_ttl;
        let (backoff_min, backoff_max) = (self.config.backoff_min, self.config.backoff_max);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let reply_to = myself.clone();
        let (task_exec_id, task_queue) = (exec_id.clone(), queue.clone());

        tracing::debug!(
            "Worker {} running job {} ({})",
            self.info.id,
            exec_id,
            payload.func_name
        );

        let task = tokio::spawn(async move {
            let _permit = permit;
            let started = tokio::time::Instant::now();
            let attempt = execute(handler, &payload, cancel_rx).await;
            let elapsed_secs = started.elapsed().as_secs_f64();

            let mut delay = backoff_min;
            let recorded = loop {
                match lifecycle::finalize(
                    store.as_ref(),
                    payload.clone(),
                    attempt.clone(),
                    elapsed_secs,
                    record_ttl,
                )
                .await
                {
                    Err(QueueError::StoreUnavailable(e)) if delay < backoff_max => {
                        tracing::warn!(
                            "Recording job {} failed, retrying in {:?}: {}",
                            task_exec_id,
                            delay,
                            e
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                    other => break other,
                }
            };
            let outcome = recorded.map_err(|error| {
                Box::new(Unrecorded {
                    payload,
                    attempt,
                    elapsed_secs,
                    error,
                })
            });

            let _ = reply_to.send_message(WorkerMessage::Finished {
                exec_id: task_exec_id,
                queue: task_queue,
                outcome,
            });
        });

        self.emit(JobEvent::JobStarted {
            exec_id: exec_id.clone(),
            queue: queue.clone(),
            worker_id: self.info.id.clone(),
            timestamp: Utc::now(),
        });
        self.running.insert(
            exec_id.to_string(),
            RunningJob {
                queue,
                cancel: Some(cancel_tx),
                task: task.abort_handle(),
            },
        );
        self.sync_running();
    }

    /// Count a recorded outcome and announce it.
    fn record(&mut self, exec_id: ExecId, queue: String, finalized: Finalized) {
        let timestamp = Utc::now();
        match finalized {
            Finalized::Completed { elapsed_secs } => {
                self.info.completed_count += 1;
                self.emit(JobEvent::JobCompleted {
                    exec_id,
                    queue,
                    elapsed_secs,
                    timestamp,
                });
            }
            Finalized::Failed { error, retries } => {
                tracing::warn!("Job {} failed: {}", exec_id, error);
                self.info.failed_count += 1;
                self.emit(JobEvent::JobFailed {
                    exec_id,
                    queue,
                    error,
                    retries,
                    will_retry: false,
                    timestamp,
                });
            }
            Finalized::Canceled => {
                tracing::info!("Job {} cancelled while running", exec_id);
                self.info.cancelled_count += 1;
                self.emit(JobEvent::JobCancelled {
                    exec_id,
                    queue,
                    timestamp,
                });
            }
            Finalized::Requeued { attempt, error } => {
                tracing::warn!("Job {} failed, retry {} queued: {}", exec_id, attempt, error);
                self.emit(JobEvent::JobFailed {
                    exec_id,
                    queue,
                    error,
                    retries: attempt,
                    will_retry: true,
                    timestamp,
                });
            }
        }
    }

    /// Keep an outcome the store rejected so the heartbeat can write it later.
    fn hold(&mut self, job: Unrecorded) {
        match job.error {
            QueueError::StoreUnavailable(_) => {
                tracing::error!(
                    "Worker {} could not record job {}, retrying on the next heartbeat: {}",
                    self.info.id,
                    job.payload.exec_id,
                    job.error
                );
                self.unrecorded.push(job);
            }
            _ => {
                tracing::error!(
                    "Worker {} dropped the outcome of job {}: {}",
                    self.info.id,
                    job.payload.exec_id,
                    job.error
                );
            }
        }
    }

    async fn retry_unrecorded(&mut self) {
        for job in std::mem::take(&mut self.unrecorded) {
            let exec_id = job.payload.exec_id.clone();
            let queue = job.payload.queue_name.clone();
            let written =
                lifecycle::finalize_unrecorded(self.store.as_ref(), &job, self.config.pending_ttl)
                    .await;
            match written {
                Ok(Some(finalized)) => {
                    tracing::info!("Recorded job {} after the store recovered", exec_id);
                    self.record(exec_id, queue, finalized);
                }
                Ok(None) => tracing::debug!("Job {} was already recorded", exec_id),
                Err(error) => self.hold(Unrecorded { error, ..job }),
            }
        }
    }
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub config: WorkerConfig,
    pub store: Arc<dyn Store>,
    pub handlers: Arc<JobHandlerRegistry>,
    pub event_tx: Option<broadcast::Sender<JobEvent>>,
}

impl WorkerArgs {
    pub fn new(config: WorkerConfig, store: Arc<dyn Store>, handlers: JobHandlerRegistry) -> Self {
        Self {
            config,
            store,
            handlers: Arc::new(handlers),
            event_tx: None,
        }
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<JobEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }
}

/// Worker actor that claims and executes jobs.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let WorkerArgs {
            config,
            store,
            handlers,
            event_tx,
        } = args;
        config.validate()?;
        tracing::info!(
            "Starting worker {} on queues {} with functions {}",
            config.worker_id,
            config.queues.join(","),
            handlers.func_names().join(",")
        );

        let mut info = WorkerInfo::new(config.worker_id.clone(), config.queues.iter().cloned());
        info.max_jobs = config.max_jobs;

        // Subscribe before announcing presence so no command addressed to us is missed.
        let commands = store.subscribe(keys::COMMAND_CHANNEL).await?;
        lifecycle::register(store.as_ref(), &info, config.presence_ttl).await?;

        let (stop_poller, stop_rx) = watch::channel(false);
        let poller = tokio::spawn(poll(myself.clone(), store.clone(), config.clone(), stop_rx));
        let mut background = vec![
            tokio::spawn(listen(myself.clone(), commands)),
            tokio::spawn(tick(myself.clone(), config.heartbeat_interval, || {
                WorkerMessage::Heartbeat
            })),
        ];
        if let Some(every) = config.reap_interval {
            background.push(tokio::spawn(tick(myself.clone(), every, || {
                WorkerMessage::Reap
            })));
        }

        let state = WorkerActorState {
            info,
            config,
            store,
            handlers,
            event_tx,
            running: HashMap::new(),
            unrecorded: Vec::new(),
            poller: Some(poller),
            stop_poller,
            background,
        };
        state.emit(JobEvent::WorkerRegistered {
            worker_id: state.info.id.clone(),
            queues: state.info.queues.iter().cloned().collect(),
            timestamp: Utc::now(),
        });
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Dispatch { payload, permit } => {
                state.start_job(&myself, *payload, permit);
            }

            WorkerMessage::CancelledBeforeStart { exec_id, queue } => {
                tracing::info!("Job {} was cancelled before it started", exec_id);
                state.info.cancelled_count += 1;
                state.emit(JobEvent::JobCancelled {
                    exec_id,
                    queue,
                    timestamp: Utc::now(),
                });
            }

            WorkerMessage::Finished {
                exec_id,
                queue,
                outcome,
            } => {
                state.running.remove(exec_id.as_str());
                state.sync_running();
                match outcome {
                    Ok(finalized) => state.record(exec_id, queue, finalized),
                    Err(job) => state.hold(*job),
                }
                state.publish_presence().await;
            }

            WorkerMessage::Command(command) => {
                let running = &state.running;
                if !command.is_addressed_to(&state.info.id, |key| running.contains_key(key)) {
                    return Ok(());
                }
                match command.action {
                    CommandAction::Cancel => {
                        if let Some(cancel) = state
                            .running
                            .get_mut(&command.key)
                            .and_then(|job| job.cancel.take())
                        {
                            tracing::info!("Cancelling job {}", command.key);
                            let _ = cancel.send(());
                        }
                    }
                    CommandAction::Shutdown => {
                        if command.key == state.info.id || command.key == WILDCARD {
                            tracing::info!("Worker {} received a shutdown command", state.info.id);
                            myself.stop(Some("shutdown command".to_string()));
                        }
                    }
                }
            }

            WorkerMessage::Heartbeat => {
                state.retry_unrecorded().await;
                state.publish_presence().await;
                state.emit(JobEvent::WorkerHeartbeat {
                    worker_id: state.info.id.clone(),
                    running: state.info.running_count,
                    timestamp: Utc::now(),
                });
            }

            WorkerMessage::Reap => {
                let recovered = lifecycle::reap_orphans(
                    state.store.as_ref(),
                    &state.config.queues,
                    state.config.pending_ttl,
                )
                .await;
                match recovered {
                    Ok(recovered) => {
                        for job in recovered {
                            let timestamp = Utc::now();
                            match job.outcome {
                                Finalized::Failed { error, retries } => {
                                    state.emit(JobEvent::JobFailed {
                                        exec_id: job.exec_id,
                                        queue: job.queue,
                                        error,
                                        retries,
                                        will_retry: false,
                                        timestamp,
                                    });
                                }
                                _ => state.emit(JobEvent::JobRecovered {
                                    exec_id: job.exec_id,
                                    queue: job.queue,
                                    lost_worker: job.lost_worker,
                                    timestamp,
                                }),
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Worker {} failed to scan for orphans: {}",
                            state.info.id,
                            e
                        );
                    }
                }
            }

            WorkerMessage::GetInfo { reply } => {
                let _ = reply.send(state.info.clone());
            }

            WorkerMessage::Shutdown => {
                tracing::info!("Shutting down worker: {}", state.info.id);
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.stop_polling().await;
        for task in state.background.drain(..) {
            task.abort();
        }
        // Claimed jobs that never started, and abandoned ones, stay in their
        // running sets for the reaper.
        for (exec_id, job) in state.running.drain() {
            tracing::warn!("Abandoning job {} on queue {}", exec_id, job.queue);
            job.task.abort();
        }
        state.sync_running();
        state.retry_unrecorded().await;

        if let Err(e) = lifecycle::unregister(state.store.as_ref(), &state.info).await {
            tracing::warn!("Worker {} failed to unregister: {}", state.info.id, e);
        }
        tracing::info!("Worker {} stopped", state.info.id);
        state.emit(JobEvent::WorkerStopped {
            worker_id: state.info.id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

/// Spawn a worker actor.
///
/// Fails if the configuration is invalid or the store cannot be reached
/// for registration.
pub async fn start_worker(
    args: WorkerArgs,
) -> Result<(ActorRef<WorkerMessage>, JoinHandle<()>), SpawnErr> {
    let name = format!("worker-{}", args.config.worker_id);
    Actor::spawn(Some(name), WorkerActor, args).await
}

/// Forward decoded commands to the actor.
async fn listen(myself: ActorRef<WorkerMessage>, mut commands: Subscription) {
    while let Some(raw) = commands.next().await {
        match Command::decode(&raw) {
            Ok(command) => {
                if myself.send_message(WorkerMessage::Command(command)).is_err() {
                    return;
                }
            }
            Err(e) => tracing::warn!("Ignoring malformed command: {}", e),
        }
    }
    tracing::warn!("Subscription to {} ended", commands.channel());
}

async fn tick(myself: ActorRef<WorkerMessage>, period: Duration, message: fn() -> WorkerMessage) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if myself.send_message(message()).is_err() {
            break;
        }
    }
}

/// Pop ids from the served queues while job slots are free, claiming each
/// one before handing it to the actor.
async fn poll(
    myself: ActorRef<WorkerMessage>,
    store: Arc<dyn Store>,
    config: WorkerConfig,
    mut stop: watch::Receiver<bool>,
) {
    let slots = Arc::new(Semaphore::new(config.max_jobs));
    let mut pending_keys: Vec<String> =
        config.queues.iter().map(|q| keys::queue_jobs(q)).collect();
    let mut delay = config.backoff_min;

    loop {
        let permit = tokio::select! {
            biased;
            _ = stop.changed() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        if *stop.borrow() {
            break;
        }
        match store.blpop(&pending_keys, config.poll_timeout).await {
            Ok(Some((key, id))) => {
                delay = config.backoff_min;
                // Start the next pop from the following queue.
                pending_keys.rotate_left(1);
                let Some(message) = take(store.as_ref(), &config, &key, &id, permit).await else {
                    continue;
                };
                if myself.send_message(message).is_err() {
                    // Claimed jobs stay in the running set for the reaper.
                    tracing::warn!(
                        "Worker {} stopped before job {} could start",
                        config.worker_id,
                        id
                    );
                    break;
                }
            }
            Ok(None) => {}
            Err(StoreError::Closed) => {
                tracing::warn!("Store closed, worker {} stops polling", config.worker_id);
                break;
            }
            Err(e) => {
                tracing::warn!("Polling failed, retrying in {:?}: {}", delay, e);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(config.backoff_max);
            }
        }
    }
}

/// Claim a popped id for this worker.
async fn take(
    store: &dyn Store,
    config: &WorkerConfig,
    key: &str,
    id: &str,
    permit: OwnedSemaphorePermit,
) -> Option<WorkerMessage> {
    let (Some(queue), Ok(exec_id)) = (keys::queue_from_jobs_key(key), ExecId::parse(id)) else {
        tracing::warn!("Discarding unexpected entry {:?} from {}", id, key);
        return None;
    };
    match lifecycle::claim(store, &exec_id, &config.worker_id, config.pending_ttl).await {
        Ok(Claim::Started(payload)) => Some(WorkerMessage::Dispatch { payload, permit }),
        Ok(Claim::Canceled(_)) => Some(WorkerMessage::CancelledBeforeStart {
            exec_id,
            queue: queue.to_string(),
        }),
        Ok(Claim::Missing) => None,
        Err(e @ QueueError::StoreUnavailable(_)) => {
            tracing::error!(
                "Worker {} could not claim job {}: {}",
                config.worker_id,
                exec_id,
                e
            );
            // The pop succeeded but the claim did not; hand the id back.
            if let Err(e) = store.rpush(key, id).await {
                tracing::error!("Job {} dropped from queue {}: {}", exec_id, queue, e);
            }
            None
        }
        Err(e) => {
            tracing::error!("Discarding job {} from queue {}: {}", exec_id, queue, e);
            None
        }
    }
}
