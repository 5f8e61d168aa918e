//! In-process store with Redis-like semantics.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::Instant;

use crate::{Batch, Op, Store, StoreError, Subscription};

#[derive(Debug)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    closed: bool,
}

impl Inner {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn purge_if_expired(&mut self, key: &str) {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
    }

    fn entry(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_if_expired(key);
        self.entries.get_mut(key)
    }

    fn list_mut(
        &mut self,
        key: &str,
        create: bool,
    ) -> Result<Option<&mut VecDeque<String>>, StoreError> {
        self.purge_if_expired(key);
        if create {
            self.entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
        }
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(Some(list)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_mut(
        &mut self,
        key: &str,
        create: bool,
    ) -> Result<Option<&mut BTreeSet<String>>, StoreError> {
        self.purge_if_expired(key);
        if create {
            self.entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Set(BTreeSet::new()),
                expires_at: None,
            });
        }
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Empty lists and sets disappear, as in Redis.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::List(list)) => list.is_empty(),
            Some(Value::Set(set)) => set.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn set_string(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn delete(&mut self, key: &str) -> bool {
        self.purge_if_expired(key);
        self.entries.remove(key).is_some()
    }

    fn rpush(&mut self, key: &str, value: &str) -> Result<usize, StoreError> {
        let list = self.list_mut(key, true)?.ok_or(StoreError::Closed)?;
        list.push_back(value.to_string());
        Ok(list.len())
    }

    fn lpop(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let popped = match self.list_mut(key, false)? {
            Some(list) => list.pop_front(),
            None => None,
        };
        self.drop_if_empty(key);
        Ok(popped)
    }

    fn lrem(&mut self, key: &str, value: &str) -> Result<usize, StoreError> {
        let removed = match self.list_mut(key, false)? {
            Some(list) => {
                let before = list.len();
                list.retain(|item| item != value);
                before - list.len()
            }
            None => 0,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn sadd(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        let set = self.set_mut(key, true)?.ok_or(StoreError::Closed)?;
        Ok(set.insert(member.to_string()))
    }

    fn srem(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed = match self.set_mut(key, false)? {
            Some(set) => set.remove(member),
            None => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// Type check a batch operation without applying it.
    fn check(&mut self, op: &Op) -> Result<(), StoreError> {
        match op {
            Op::Set { .. } | Op::Delete { .. } => Ok(()),
            Op::RPush { key, .. } | Op::LRem { key, .. } => {
                self.list_mut(key, false).map(|_| ())
            }
            Op::SAdd { key, .. } | Op::SRem { key, .. } => {
                self.set_mut(key, false).map(|_| ())
            }
        }
    }

    fn apply(&mut self, op: Op) -> Result<(), StoreError> {
        match op {
            Op::Set { key, value, ttl } => self.set_string(&key, &value, ttl),
            Op::Delete { key } => {
                self.delete(&key);
            }
            Op::RPush { key, value } => {
                self.rpush(&key, &value)?;
            }
            Op::LRem { key, value } => {
                self.lrem(&key, &value)?;
            }
            Op::SAdd { key, member } => {
                self.sadd(&key, &member)?;
            }
            Op::SRem { key, member } => {
                self.srem(&key, &member)?;
            }
        }
        Ok(())
    }
}

/// Resolve Redis-style inclusive range indices against a list length.
fn range_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

/// Store living entirely in process memory.
///
/// Shared between a queue and its workers through an `Arc`, it gives the
/// same claim and pub/sub guarantees a Redis server would for a single
/// process. Expiry is evaluated lazily on access.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn apply_batch(&self, guard: Option<&str>, batch: Batch) -> Result<bool, StoreError> {
        let pushes = batch.ops().iter().any(|op| matches!(op, Op::RPush { .. }));
        {
            let mut inner = self.inner.lock().await;
            inner.ensure_open()?;
            if let Some(guard) = guard {
                if inner.entry(guard).is_some() {
                    return Ok(false);
                }
            }
            // Nothing is applied unless every operation type checks.
            for op in batch.ops() {
                inner.check(op)?;
            }
            for op in batch.into_ops() {
                inner.apply(op)?;
            }
        }
        if pushes {
            self.pushed.notify_waiters();
        }
        Ok(true)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        match inner.entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner.set_string(key, value, ttl);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        Ok(inner.entry(key).is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        Ok(inner.delete(key))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let len = {
            let mut inner = self.inner.lock().await;
            inner.ensure_open()?;
            inner.rpush(key, value)?
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner.lpop(key)
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before looking so a push between the check
            // and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                inner.ensure_open()?;
                for key in keys {
                    if let Some(value) = inner.lpop(key)? {
                        return Ok(Some((key.clone(), value)));
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        let Some(list) = inner.list_mut(key, false)? else {
            return Ok(Vec::new());
        };
        Ok(match range_bounds(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        Ok(inner.list_mut(key, false)?.map_or(0, |list| list.len()))
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner.lrem(key, value)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner.sadd(key, member)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner.srem(key, member)
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        Ok(inner.set_mut(key, false)?.cloned().unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        Ok(inner.set_mut(key, false)?.map_or(0, |set| set.len()))
    }

    async fn execute(&self, batch: Batch) -> Result<(), StoreError> {
        self.apply_batch(None, batch).await.map(|_| ())
    }

    async fn execute_if_absent(&self, guard: &str, batch: Batch) -> Result<bool, StoreError> {
        self.apply_batch(Some(guard), batch).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        let Some(subscribers) = inner.channels.get_mut(channel) else {
            return Ok(0);
        };
        subscribers.retain(|tx| tx.send(message.to_string()).is_ok());
        Ok(subscribers.len())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.channels.entry(channel.to_string()).or_default().push(tx);
        Ok(Subscription::new(channel, rx))
    }

    async fn close(&self) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            inner.channels.clear();
        }
        self.pushed.notify_waiters();
        Ok(())
    }
}
