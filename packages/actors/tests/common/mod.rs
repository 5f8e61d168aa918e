use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use queue_core::{ExecId, JobPayload, JobStatus, keys};
use store::{Batch, MemoryStore, Op, Store, StoreError, Subscription};

/// In-memory store that can refuse atomic writes on demand and remembers
/// every status written to a job record.
#[derive(Default)]
pub struct TestStore {
    inner: MemoryStore,
    failing: AtomicBool,
    statuses: Mutex<HashMap<String, Vec<JobStatus>>>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, `execute` and `execute_if_absent` fail as if the store were down.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Statuses written to the job's record, oldest first.
    pub fn statuses(&self, exec_id: &ExecId) -> Vec<JobStatus> {
        self.statuses
            .lock()
            .unwrap()
            .get(&keys::job(exec_id))
            .cloned()
            .unwrap_or_default()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("injected outage".into()));
        }
        Ok(())
    }

    fn note(&self, key: &str, value: &str) {
        if !key.starts_with("job::") {
            return;
        }
        if let Ok(payload) = JobPayload::decode(value) {
            let mut statuses = self.statuses.lock().unwrap();
            statuses.entry(key.to_string()).or_default().push(payload.status);
        }
    }

    fn note_batch(&self, ops: &[Op]) {
        for op in ops {
            if let Op::Set { key, value, .. } = op {
                self.note(key, value);
            }
        }
    }
}

#[async_trait]
impl Store for TestStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.inner.set(key, value, ttl).await?;
        self.note(key, value);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.inner.rpush(key, value).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.lpop(key).await
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        self.inner.blpop(keys, timeout).await
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        self.inner.lrange(key, start, stop).await
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        self.inner.llen(key).await
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.inner.lrem(key, value).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        self.inner.smembers(key).await
    }

    async fn scard(&self, key: &str) -> Result<usize, StoreError> {
        self.inner.scard(key).await
    }

    async fn execute(&self, batch: Batch) -> Result<(), StoreError> {
        self.check()?;
        let ops = batch.ops().to_vec();
        self.inner.execute(batch).await?;
        self.note_batch(&ops);
        Ok(())
    }

    async fn execute_if_absent(&self, guard: &str, batch: Batch) -> Result<bool, StoreError> {
        self.check()?;
        let ops = batch.ops().to_vec();
        let applied = self.inner.execute_if_absent(guard, batch).await?;
        if applied {
            self.note_batch(&ops);
        }
        Ok(applied)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.inner.subscribe(channel).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}
