use std::collections::BTreeSet;
use std::sync::Arc;

use queue_core::{Command, QueueError, WorkerInfo, keys};
use store::Store;

/// Reference to a worker by id. Nothing guarantees the worker still exists.
#[derive(Clone)]
pub struct WorkerHandle {
    id: String,
    store: Arc<dyn Store>,
}

impl WorkerHandle {
    pub fn new(id: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self {
            id: id.into(),
            store,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The worker's last published presence record.
    pub async fn info(&self) -> Result<Option<WorkerInfo>, QueueError> {
        match self.store.get(&keys::worker(&self.id)).await? {
            Some(raw) => Ok(Some(WorkerInfo::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Whether the presence record is still live.
    pub async fn is_alive(&self) -> Result<bool, QueueError> {
        Ok(self.store.exists(&keys::worker(&self.id)).await?)
    }

    /// Ask the worker to stop. Returns how many listeners received the request.
    pub async fn shutdown(&self) -> Result<usize, QueueError> {
        publish(self.store.as_ref(), &Command::shutdown(&self.id)).await
    }
}

/// Every registered worker id, whatever queues it serves.
pub async fn list_workers(store: &dyn Store) -> Result<BTreeSet<String>, QueueError> {
    Ok(store.smembers(keys::WORKERS).await?)
}

/// Ask every listening worker to stop.
pub async fn shutdown_all(store: &dyn Store) -> Result<usize, QueueError> {
    publish(store, &Command::shutdown_all()).await
}

async fn publish(store: &dyn Store, command: &Command) -> Result<usize, QueueError> {
    Ok(store
        .publish(keys::COMMAND_CHANNEL, &command.encode()?)
        .await?)
}
