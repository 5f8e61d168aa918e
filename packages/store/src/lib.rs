//! Store adapter for the job queue system.
//!
//! The queue keeps all of its shared state (job records, pending lists,
//! membership sets, worker presence) in a Redis-class store and uses its
//! pub/sub channels for control commands. This crate defines the capability
//! interface the rest of the workspace programs against, plus two backends.
//!
//! # Features
//!
//! - `redis` (default): [`RedisStore`], backed by a Redis server
//!
//! [`MemoryStore`] is always available and follows Redis semantics closely
//! enough to run a queue and its workers inside one process.

mod batch;
mod config;
mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use queue_core::QueueError;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use batch::{Batch, Op};
pub use config::{StoreConfig, open};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use crate::redis::RedisStore;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("WRONGTYPE operation against key holding the wrong kind of value: {0}")]
    WrongType(String),
    #[error("Unsupported store url: {0}")]
    UnsupportedUrl(String),
    #[error("Store is closed")]
    Closed,
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        QueueError::StoreUnavailable(err.to_string())
    }
}

/// Capability interface over a shared key/value + list + set + pub/sub store.
///
/// List ranges follow Redis conventions: both ends inclusive, negative
/// indices count from the tail.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a string value. `ttl` replaces any previous expiry; `None` clears it.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete a key of any type. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Append to the tail of a list. Returns the new length.
    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    /// Pop from the head of a list.
    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Pop from the head of the first non-empty list, waiting up to `timeout`.
    ///
    /// Each pushed value is handed to exactly one popper. Returns the list key
    /// the value came from.
    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError>;

    async fn lrange(&self, key: &str, start: isize, stop: isize)
    -> Result<Vec<String>, StoreError>;

    async fn llen(&self, key: &str) -> Result<usize, StoreError>;

    /// Remove every occurrence of `value` from a list. Returns how many were removed.
    async fn lrem(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    /// Returns whether the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Returns whether the member was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StoreError>;

    async fn scard(&self, key: &str) -> Result<usize, StoreError>;

    /// Apply every operation of the batch as one indivisible unit.
    async fn execute(&self, batch: Batch) -> Result<(), StoreError>;

    /// Apply the batch as one unit only if `guard` does not exist.
    ///
    /// Returns whether the batch was applied.
    async fn execute_if_absent(&self, guard: &str, batch: Batch) -> Result<bool, StoreError>;

    /// Publish a message. Returns how many subscribers received it.
    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;

    /// Release connections. Further calls may fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;
}

/// Stream of messages published on one channel.
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            channel: channel.into(),
            rx,
            forwarder: None,
        }
    }

    /// Attach the task feeding this subscription so it stops with it.
    pub fn with_forwarder(mut self, forwarder: JoinHandle<()>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message. `None` once the channel is closed.
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
