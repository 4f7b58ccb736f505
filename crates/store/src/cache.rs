//! Fast key-value cache for current-state lookups.
//!
//! The cache is best-effort: callers log its failures and carry on.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use common::PayerId;
use tokio::sync::RwLock;

use crate::{Result, StoreError};

/// Composite cache key, rendered as `namespace:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: &'static str,
    id: String,
}

impl CacheKey {
    pub fn new(namespace: &'static str, id: impl Into<String>) -> Self {
        Self {
            namespace,
            id: id.into(),
        }
    }

    /// The list of active licenses a payer holds.
    pub fn payer_licenses(payer_id: &PayerId) -> Self {
        Self::new("payer_licenses", payer_id.as_str())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<serde_json::Value>>;

    async fn put(&self, key: &CacheKey, value: serde_json::Value) -> Result<()>;

    async fn delete(&self, key: &CacheKey) -> Result<()>;
}

/// In-memory cache with fault injection for tests.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<RwLock<HashMap<String, serde_json::Value>>>,
    failing_puts: Arc<AtomicU32>,
    failing_gets: Arc<AtomicU32>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` writes fail.
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` reads fail.
    pub fn fail_next_gets(&self, n: u32) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// Reads an entry directly, bypassing fault injection.
    pub async fn peek(&self, key: &CacheKey) -> Option<serde_json::Value> {
        self.entries.read().await.get(&key.to_string()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl KeyValueCache for InMemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<serde_json::Value>> {
        if take_fault(&self.failing_gets) {
            return Err(StoreError::Unavailable(format!("cache read {key} refused")));
        }
        Ok(self.entries.read().await.get(&key.to_string()).cloned())
    }

    async fn put(&self, key: &CacheKey, value: serde_json::Value) -> Result<()> {
        if take_fault(&self.failing_puts) {
            return Err(StoreError::Unavailable(format!("cache write {key} refused")));
        }
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        self.entries.write().await.remove(&key.to_string());
        Ok(())
    }
}
