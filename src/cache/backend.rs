//! Key/value backends for rendered fragments.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use thiserror::Error;
use tokio::time::Instant;

use super::config::CacheConfig;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::backend";
const METRIC_FRAGMENT_EVICT_TOTAL: &str = "matryoshka_fragment_evict_total";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Opaque get/add service holding rendered fragments.
///
/// `add` never overwrites: it returns `Ok(false)` when a live value is
/// already stored under the key. Eviction is the backend's own business.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn add(&self, key: &str, value: String, ttl: Option<Duration>)
    -> Result<bool, BackendError>;
}

struct StoredFragment {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredFragment {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

/// In-process LRU backend with per-entry expiry.
pub struct MemoryBackend {
    entries: Mutex<LruCache<String, StoredFragment>>,
}

impl MemoryBackend {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_capacity(config.memory_limit_non_zero())
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of stored entries, expired ones included until they are read.
    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");

        let expired = match entries.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn add(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "add");

        if entries.peek(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }

        // A deadline past what `Instant` can represent never expires.
        let stored = StoredFragment {
            value,
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
        };
        // `push` also hands back an expired entry it replaced under the same key.
        if let Some((evicted, _)) = entries.push(key.to_string(), stored) {
            if evicted != key {
                counter!(METRIC_FRAGMENT_EVICT_TOTAL).increment(1);
            }
        }
        Ok(true)
    }
}
