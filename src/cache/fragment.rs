//! Fragment cache.
//!
//! Memoizes rendered blocks under `logical/fingerprint/location`. A new
//! logical key (a write advanced the freshness token) or a new fingerprint
//! (the block's template source was edited) both land on a fresh key, so
//! stale entries are simply never read again and age out of the backend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, warn};

use super::backend::KvBackend;
use super::config::CacheConfig;
use super::keys::{FragmentKey, FragmentSite};

const METRIC_FRAGMENT_HIT_TOTAL: &str = "matryoshka_fragment_hit_total";
const METRIC_FRAGMENT_MISS_TOTAL: &str = "matryoshka_fragment_miss_total";
const METRIC_FRAGMENT_BYPASS_TOTAL: &str = "matryoshka_fragment_bypass_total";
const METRIC_FRAGMENT_STORE_CONFLICT_TOTAL: &str = "matryoshka_fragment_store_conflict_total";
const METRIC_FRAGMENT_BACKEND_ERROR_TOTAL: &str = "matryoshka_fragment_backend_error_total";

pub struct FragmentCache {
    config: CacheConfig,
    backend: Arc<dyn KvBackend>,
}

impl FragmentCache {
    pub fn new(config: CacheConfig, backend: Arc<dyn KvBackend>) -> Self {
        Self { config, backend }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the cached render for this fragment, or render and store it.
    ///
    /// A missing or empty `logical_key` bypasses the cache: `render` runs and
    /// nothing is read or written. Otherwise `render` runs at most once, and
    /// only on a miss (an empty stored value counts as a miss). The result is
    /// stored with an add-if-absent write, so a concurrent render that stored
    /// first wins; this call still returns its own output.
    ///
    /// Backend failures never fail the render: a failed lookup is a miss and a
    /// failed store is ignored. Errors from `render` propagate and nothing is
    /// stored.
    pub async fn cached_render<F, Fut, E>(
        &self,
        logical_key: Option<&str>,
        timeout: Option<Duration>,
        site: &FragmentSite,
        render: F,
    ) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let logical_key = match logical_key {
            Some(key) if !key.is_empty() && self.config.enabled => key,
            _ => {
                counter!(METRIC_FRAGMENT_BYPASS_TOTAL).increment(1);
                return render().await;
            }
        };

        let key = FragmentKey::compose(logical_key, site);

        match self.backend.get(key.as_str()).await {
            Ok(Some(value)) if !value.is_empty() => {
                counter!(METRIC_FRAGMENT_HIT_TOTAL).increment(1);
                debug!(cache = "fragment", outcome = "hit", key = %key);
                return Ok(value);
            }
            Ok(_) => {}
            Err(err) => {
                counter!(METRIC_FRAGMENT_BACKEND_ERROR_TOTAL).increment(1);
                warn!(
                    cache = "fragment",
                    op = "get",
                    key = %key,
                    error = %err,
                    "fragment lookup failed, rendering"
                );
            }
        }

        counter!(METRIC_FRAGMENT_MISS_TOTAL).increment(1);
        debug!(cache = "fragment", outcome = "miss", key = %key);

        let rendered = render().await?;

        match self
            .backend
            .add(key.as_str(), rendered.clone(), self.effective_ttl(timeout))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                counter!(METRIC_FRAGMENT_STORE_CONFLICT_TOTAL).increment(1);
                debug!(cache = "fragment", key = %key, "fragment already stored by another render");
            }
            Err(err) => {
                counter!(METRIC_FRAGMENT_BACKEND_ERROR_TOTAL).increment(1);
                warn!(
                    cache = "fragment",
                    op = "add",
                    key = %key,
                    error = %err,
                    "fragment store failed"
                );
            }
        }

        Ok(rendered)
    }

    /// Explicit zero means "no expiry"; no timeout falls back to the configured default.
    fn effective_ttl(&self, timeout: Option<Duration>) -> Option<Duration> {
        timeout
            .or_else(|| self.config.default_timeout())
            .filter(|ttl| !ttl.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::cache::backend::{BackendError, MemoryBackend};

    fn site(body: &str) -> FragmentSite {
        FragmentSite::for_source(body, "templates/test.html")
    }

    fn memory_cache() -> FragmentCache {
        let config = CacheConfig::default();
        let backend = Arc::new(MemoryBackend::new(&config));
        FragmentCache::new(config, backend)
    }

    async fn render_counting(
        cache: &FragmentCache,
        key: Option<&str>,
        site: &FragmentSite,
        calls: &AtomicUsize,
        output: &str,
    ) -> String {
        cache
            .cached_render(key, None, site, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(output.to_string())
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn second_render_is_served_from_cache() {
        let cache = memory_cache();
        let calls = AtomicUsize::new(0);
        let site = site("<p>{{ x }}</p>");

        let first = render_counting(&cache, Some("k"), &site, &calls, "one").await;
        let second = render_counting(&cache, Some("k"), &site, &calls, "two").await;

        assert_eq!(first, "one");
        assert_eq!(second, "one");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_or_empty_key_always_renders() {
        let cache = memory_cache();
        let calls = AtomicUsize::new(0);
        let site = site("body");

        render_counting(&cache, None, &site, &calls, "a").await;
        render_counting(&cache, None, &site, &calls, "b").await;
        render_counting(&cache, Some(""), &site, &calls, "c").await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fingerprint_or_location_change_misses() {
        let cache = memory_cache();
        let calls = AtomicUsize::new(0);

        render_counting(&cache, Some("k"), &site("v1"), &calls, "a").await;
        let edited = render_counting(&cache, Some("k"), &site("v2"), &calls, "b").await;
        let moved = render_counting(
            &cache,
            Some("k"),
            &FragmentSite::for_source("v1", "templates/other.html"),
            &calls,
            "c",
        )
        .await;

        assert_eq!(edited, "b");
        assert_eq!(moved, "c");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn disabled_cache_bypasses_backend() {
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        let backend = Arc::new(MemoryBackend::new(&config));
        let cache = FragmentCache::new(config, backend.clone());
        let calls = AtomicUsize::new(0);

        render_counting(&cache, Some("k"), &site("b"), &calls, "a").await;
        render_counting(&cache, Some("k"), &site("b"), &calls, "a").await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn render_errors_propagate_and_store_nothing() {
        let config = CacheConfig::default();
        let backend = Arc::new(MemoryBackend::new(&config));
        let cache = FragmentCache::new(config, backend.clone());

        let result = cache
            .cached_render(Some("k"), None, &site("b"), || async {
                Err::<String, _>("boom")
            })
            .await;

        assert_eq!(result, Err("boom"));
        assert!(backend.is_empty());
    }

    #[derive(Default)]
    struct ScriptedBackend {
        stored: Mutex<Option<String>>,
        fail_get: bool,
        fail_add: bool,
        adds: Mutex<Vec<(String, Option<Duration>)>>,
    }

    #[async_trait]
    impl KvBackend for ScriptedBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>, BackendError> {
            if self.fail_get {
                return Err(BackendError::Unavailable("down".into()));
            }
            Ok(self.stored.lock().unwrap().clone())
        }

        async fn add(
            &self,
            key: &str,
            _value: String,
            ttl: Option<Duration>,
        ) -> Result<bool, BackendError> {
            self.adds.lock().unwrap().push((key.to_string(), ttl));
            if self.fail_add {
                return Err(BackendError::Unavailable("down".into()));
            }
            Ok(false)
        }
    }

    #[tokio::test]
    async fn backend_failures_degrade_to_rendering() {
        let backend = Arc::new(ScriptedBackend {
            fail_get: true,
            fail_add: true,
            ..Default::default()
        });
        let cache = FragmentCache::new(CacheConfig::default(), backend.clone());
        let calls = AtomicUsize::new(0);

        let out = render_counting(&cache, Some("k"), &site("b"), &calls, "fresh").await;

        assert_eq!(out, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.adds.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_cached_value_counts_as_miss() {
        let backend = Arc::new(ScriptedBackend {
            stored: Mutex::new(Some(String::new())),
            ..Default::default()
        });
        let cache = FragmentCache::new(CacheConfig::default(), backend);
        let calls = AtomicUsize::new(0);

        let out = render_counting(&cache, Some("k"), &site("b"), &calls, "fresh").await;

        assert_eq!(out, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lost_add_race_still_returns_own_render() {
        let backend = Arc::new(ScriptedBackend::default());
        let cache = FragmentCache::new(CacheConfig::default(), backend);
        let calls = AtomicUsize::new(0);

        let out = render_counting(&cache, Some("k"), &site("b"), &calls, "mine").await;
        assert_eq!(out, "mine");
    }

    #[tokio::test]
    async fn huge_timeout_renders_and_caches() {
        let cache = memory_cache();
        let site = site("b");

        for output in ["x", "y"] {
            let out = cache
                .cached_render(
                    Some("k"),
                    Some(Duration::from_secs(u64::MAX)),
                    &site,
                    || async { Ok::<_, Infallible>(output.to_string()) },
                )
                .await
                .unwrap();
            assert_eq!(out, "x");
        }
    }

    #[tokio::test]
    async fn timeout_resolution() {
        let backend = Arc::new(ScriptedBackend::default());
        let config = CacheConfig {
            default_timeout_secs: 60,
            ..Default::default()
        };
        let cache = FragmentCache::new(config, backend.clone());
        let site = site("b");

        for timeout in [None, Some(Duration::ZERO), Some(Duration::from_secs(5))] {
            cache
                .cached_render(Some("k"), timeout, &site, || async {
                    Ok::<_, Infallible>("x".to_string())
                })
                .await
                .unwrap();
        }

        let ttls: Vec<Option<Duration>> = backend
            .adds
            .lock()
            .unwrap()
            .iter()
            .map(|(_, ttl)| *ttl)
            .collect();
        assert_eq!(
            ttls,
            vec![
                Some(Duration::from_secs(60)),
                None,
                Some(Duration::from_secs(5))
            ]
        );
    }
}
