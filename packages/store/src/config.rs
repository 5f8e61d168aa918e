//! Store selection and connection.

use std::sync::Arc;

use crate::{MemoryStore, Store, StoreError};

/// Store connection configuration.
///
/// The URL scheme selects the backend: `memory://` for the in-process store,
/// `redis://` or `rediss://` for a Redis server.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::memory()
    }
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn memory() -> Self {
        Self::new("memory://")
    }

    pub fn redis(url: impl Into<String>) -> Self {
        Self::new(url)
    }

    /// Scheme part of the URL, without the `://`.
    pub fn scheme(&self) -> &str {
        self.url.split_once("://").map_or("", |(scheme, _)| scheme)
    }
}

/// Open the store described by `config`.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn Store>, StoreError> {
    tracing::info!("Opening {} store", config.scheme());
    match config.scheme() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "redis")]
        "redis" | "rediss" => Ok(Arc::new(crate::RedisStore::connect(&config.url).await?)),
        _ => Err(StoreError::UnsupportedUrl(config.url.clone())),
    }
}
