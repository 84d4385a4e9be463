//! Response cache with single-flight de-duplication.
//!
//! ## Responsibility
//! Cache completed inference responses keyed by request fingerprint, evict
//! least-recently-used entries under entry/byte budgets, and coalesce
//! concurrent requests for the same fingerprint onto one backend call.
//!
//! ## Guarantees
//! - At most one in-flight compute per fingerprint; every coalesced caller
//!   receives the shared result or the shared error
//! - A failed compute caches nothing and frees the fingerprint for retry
//! - All table mutation (insert, evict, resize, mark-in-flight,
//!   mark-complete) is serialized under one lock; the compute itself runs
//!   outside it, so unrelated fingerprints never block each other
//! - A caller abandoning its wait (own timeout) does not cancel the
//!   computation — remaining waiters still get the result
//!
//! ## NOT Responsible For
//! - Deciding what to compute (callers pass the compute future)
//! - Retry/breaker semantics around the backend (see: retry.rs,
//!   circuit_breaker.rs)

use crate::{GenerationParams, GovernorError, QuantizationTier};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

/// Derive the deterministic cache key for a request.
///
/// SHA-256 over the whitespace-normalized prompt, the canonical parameter
/// encoding, and the tier tag — identical inputs always collide, distinct
/// inputs practically never do.
pub fn fingerprint(prompt: &str, params: &GenerationParams, tier: QuantizationTier) -> String {
    let normalized: Vec<&str> = prompt.split_whitespace().collect();
    let mut hasher = Sha256::new();
    hasher.update(normalized.join(" ").as_bytes());
    hasher.update([0u8]);
    hasher.update(params.canonical().as_bytes());
    hasher.update([0u8]);
    hasher.update(tier.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// A completed cache entry.
#[derive(Debug, Clone)]
struct CacheEntry {
    response: String,
    size_bytes: u64,
    inserted_at: SystemTime,
    last_access: u64,
}

/// A successful lookup: the response plus whether it came from a completed
/// entry (`hit`) or from a compute this caller triggered or joined.
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    /// The response payload.
    pub response: String,
    /// True when served from a completed entry without any compute.
    pub hit: bool,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    /// Completed entries currently held.
    pub entries: usize,
    /// Entry budget.
    pub capacity: usize,
    /// Total bytes held by completed entries.
    pub total_bytes: u64,
    /// Optional byte budget.
    pub byte_budget: Option<u64>,
    /// Computations currently in flight.
    pub in_flight: usize,
    /// Lookups served from completed entries.
    pub hits: u64,
    /// Lookups that triggered a compute.
    pub misses: u64,
    /// Entries evicted by budget pressure.
    pub evictions: u64,
    /// Callers that joined an existing in-flight compute.
    pub coalesced: u64,
}

impl CacheStats {
    /// `entries / capacity`, the health monitor's occupancy signal.
    pub fn occupancy_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.entries as f64 / self.capacity as f64
    }
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    in_flight: HashMap<String, broadcast::Sender<Result<String, GovernorError>>>,
    max_entries: usize,
    max_bytes: Option<u64>,
    total_bytes: u64,
    access_clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    coalesced: u64,
}

impl CacheInner {
    fn touch(&mut self, fp: &str) -> Option<String> {
        self.access_clock += 1;
        let clock = self.access_clock;
        let entry = self.entries.get_mut(fp)?;
        entry.last_access = clock;
        Some(entry.response.clone())
    }

    fn insert(&mut self, fp: String, response: String) {
        self.access_clock += 1;
        let size_bytes = (fp.len() + response.len()) as u64;
        if let Some(old) = self.entries.insert(
            fp,
            CacheEntry {
                response,
                size_bytes,
                inserted_at: SystemTime::now(),
                last_access: self.access_clock,
            },
        ) {
            self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
        }
        self.total_bytes += size_bytes;
        self.evict_to_budget();
    }

    fn remove(&mut self, fp: &str) -> bool {
        match self.entries.remove(fp) {
            Some(entry) => {
                self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
                true
            }
            None => false,
        }
    }

    /// Evict least-recently-accessed entries until both budgets hold.
    fn evict_to_budget(&mut self) {
        loop {
            let over_entries = self.entries.len() > self.max_entries;
            let over_bytes = self
                .max_bytes
                .is_some_and(|budget| self.total_bytes > budget);
            if !over_entries && !over_bytes {
                break;
            }
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(fp, e)| (fp.clone(), e.inserted_at));
            match victim {
                Some((fp, inserted_at)) => {
                    self.remove(&fp);
                    self.evictions += 1;
                    debug!(
                        fingerprint = %fp,
                        resident_secs = inserted_at.elapsed().unwrap_or_default().as_secs(),
                        "cache entry evicted"
                    );
                }
                None => break,
            }
        }
    }
}

/// Adaptive-capacity LRU response cache. Cheap to clone; clones share the
/// same store.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<Mutex<CacheInner>>,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache").finish_non_exhaustive()
    }
}

enum Lookup {
    Hit(String),
    Join(broadcast::Receiver<Result<String, GovernorError>>),
    Owner(broadcast::Sender<Result<String, GovernorError>>),
}

impl ResponseCache {
    /// Create a cache with the given entry budget and optional byte budget.
    pub fn new(max_entries: usize, max_bytes: Option<u64>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                max_entries,
                max_bytes,
                total_bytes: 0,
                access_clock: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                coalesced: 0,
            })),
        }
    }

    /// Look up `fp`, computing on miss with single-flight coalescing.
    ///
    /// The first caller for a fingerprint owns the computation; it runs
    /// detached, so callers that stop waiting (e.g. wrap this call in
    /// `tokio::time::timeout`) never cancel it for the others. On success
    /// the response is cached and fanned out; on failure the same error is
    /// fanned out, nothing is cached, and the fingerprint is free for the
    /// next attempt.
    ///
    /// # Errors
    ///
    /// Propagates the compute error to every coalesced caller.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fp: &str,
        compute: F,
    ) -> Result<CacheOutcome, GovernorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, GovernorError>> + Send + 'static,
    {
        let lookup = {
            let mut inner = self.inner.lock().await;
            if let Some(response) = inner.touch(fp) {
                inner.hits += 1;
                debug!(fingerprint = %fp, "cache hit");
                Lookup::Hit(response)
            } else if let Some(tx) = inner.in_flight.get(fp) {
                let rx = tx.subscribe();
                inner.coalesced += 1;
                debug!(fingerprint = %fp, "joining in-flight compute");
                Lookup::Join(rx)
            } else {
                inner.misses += 1;
                let (tx, _) = broadcast::channel(1);
                inner.in_flight.insert(fp.to_string(), tx.clone());
                debug!(fingerprint = %fp, "cache miss, compute registered");
                Lookup::Owner(tx)
            }
        };

        let mut rx = match lookup {
            Lookup::Hit(response) => {
                return Ok(CacheOutcome {
                    response,
                    hit: true,
                })
            }
            Lookup::Join(rx) => rx,
            Lookup::Owner(tx) => {
                // Subscribe before spawning so the result cannot be missed.
                let rx = tx.subscribe();
                let cache = self.clone();
                let fp = fp.to_string();
                let fut = compute();
                tokio::spawn(async move {
                    let result = fut.await;
                    let mut inner = cache.inner.lock().await;
                    inner.in_flight.remove(&fp);
                    match &result {
                        Ok(response) => inner.insert(fp.clone(), response.clone()),
                        Err(e) => {
                            debug!(fingerprint = %fp, error = %e, "compute failed, nothing cached")
                        }
                    }
                    if tx.send(result).is_err() {
                        warn!(fingerprint = %fp, "all cache waiters gone before completion");
                    }
                });
                rx
            }
        };

        match rx.recv().await {
            Ok(Ok(response)) => Ok(CacheOutcome {
                response,
                hit: false,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GovernorError::Backend(
                "in-flight computation dropped before completing".to_string(),
            )),
        }
    }

    /// Remove a completed entry. In-flight computations are unaffected.
    pub async fn invalidate(&self, fp: &str) {
        let mut inner = self.inner.lock().await;
        if inner.remove(fp) {
            debug!(fingerprint = %fp, "cache entry invalidated");
        }
    }

    /// Change the entry budget, evicting immediately if the cache is over
    /// the new budget. Called by the governor's pressure-reaction task.
    pub async fn resize(&self, new_capacity: usize) {
        let mut inner = self.inner.lock().await;
        if inner.max_entries != new_capacity {
            debug!(from = inner.max_entries, to = new_capacity, "cache resized");
        }
        inner.max_entries = new_capacity;
        inner.evict_to_budget();
    }

    /// Change the byte budget, evicting immediately if needed.
    pub async fn set_byte_budget(&self, max_bytes: Option<u64>) {
        let mut inner = self.inner.lock().await;
        inner.max_bytes = max_bytes;
        inner.evict_to_budget();
    }

    /// Drop all completed entries. In-flight computations are unaffected.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.total_bytes = 0;
        debug!("cache cleared");
    }

    /// Current statistics.
    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            entries: inner.entries.len(),
            capacity: inner.max_entries,
            total_bytes: inner.total_bytes,
            byte_budget: inner.max_bytes,
            in_flight: inner.in_flight.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            coalesced: inner.coalesced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn params() -> GenerationParams {
        GenerationParams::default()
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = fingerprint("hello world", &params(), QuantizationTier::Q4_0);
        let b = fingerprint("hello world", &params(), QuantizationTier::Q4_0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_normalizes_whitespace() {
        let a = fingerprint("hello   world", &params(), QuantizationTier::Q4_0);
        let b = fingerprint("  hello world  ", &params(), QuantizationTier::Q4_0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_prompt_params_tier() {
        let base = fingerprint("hello", &params(), QuantizationTier::Q4_0);
        assert_ne!(base, fingerprint("goodbye", &params(), QuantizationTier::Q4_0));
        assert_ne!(
            base,
            fingerprint(
                "hello",
                &GenerationParams {
                    max_tokens: 512,
                    ..params()
                },
                QuantizationTier::Q4_0
            )
        );
        assert_ne!(base, fingerprint("hello", &params(), QuantizationTier::F16));
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = fingerprint("x", &params(), QuantizationTier::Q8_0);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_miss_computes_then_hit_serves_cached() {
        let cache = ResponseCache::new(16, None);
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let out = cache
            .get_or_compute("fp-1", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok("answer".to_string())
            })
            .await
            .unwrap();
        assert_eq!(out.response, "answer");
        assert!(!out.hit);

        let c = calls.clone();
        let out = cache
            .get_or_compute("fp-1", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok("recomputed".to_string())
            })
            .await
            .unwrap();
        assert_eq!(out.response, "answer");
        assert!(out.hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "compute ran exactly once");
    }

    #[tokio::test]
    async fn test_concurrent_same_fingerprint_computes_once() {
        let cache = ResponseCache::new(16, None);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("shared", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok("shared-answer".to_string())
                    })
                    .await
            }));
        }

        for h in handles {
            let out = h.await.unwrap().unwrap();
            assert_eq!(out.response, "shared-answer");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "single-flight violated");
    }

    #[tokio::test]
    async fn test_failure_propagates_to_all_waiters_and_caches_nothing() {
        let cache = ResponseCache::new(16, None);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("doomed", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err::<String, _>(GovernorError::Backend("kaboom".to_string()))
                    })
                    .await
            }));
        }

        for h in handles {
            let result = h.await.unwrap();
            assert!(matches!(result, Err(GovernorError::Backend(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().await.entries, 0, "failure must cache nothing");

        // Fingerprint is free again: the next attempt computes fresh.
        let out = cache
            .get_or_compute("doomed", || async { Ok("recovered".to_string()) })
            .await
            .unwrap();
        assert_eq!(out.response, "recovered");
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_cancel_compute() {
        let cache = ResponseCache::new(16, None);

        let slow = cache.get_or_compute("slow", || async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok("worth the wait".to_string())
        });
        // The caller gives up after 10ms...
        assert!(tokio::time::timeout(Duration::from_millis(10), slow)
            .await
            .is_err());

        // ...but the detached compute completes and lands in the cache.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let out = cache
            .get_or_compute("slow", || async {
                Err::<String, _>(GovernorError::Backend("should not run".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(out.response, "worth the wait");
        assert!(out.hit);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_accessed_first() {
        let cache = ResponseCache::new(3, None);
        for key in ["a", "b", "c"] {
            let value = format!("val-{key}");
            cache
                .get_or_compute(key, move || async move { Ok(value) })
                .await
                .unwrap();
        }

        // Refresh "a" so "b" becomes the LRU victim.
        cache
            .get_or_compute("a", || async { Ok(String::new()) })
            .await
            .unwrap();
        cache
            .get_or_compute("d", || async { Ok("val-d".to_string()) })
            .await
            .unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.evictions, 1);

        // "b" was evicted; a fresh compute proves it.
        let recomputed = Arc::new(AtomicUsize::new(0));
        let r = recomputed.clone();
        cache
            .get_or_compute("b", move || async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok("again".to_string())
            })
            .await
            .unwrap();
        assert_eq!(recomputed.load(Ordering::SeqCst), 1);

        // "a" survived its refresh.
        let out = cache
            .get_or_compute("a", || async {
                Err::<String, _>(GovernorError::Backend("must be cached".to_string()))
            })
            .await
            .unwrap();
        assert!(out.hit);
    }

    #[tokio::test]
    async fn test_resize_evicts_immediately() {
        let cache = ResponseCache::new(8, None);
        for i in 0..8 {
            cache
                .get_or_compute(&format!("k{i}"), move || async move { Ok("v".to_string()) })
                .await
                .unwrap();
        }
        assert_eq!(cache.stats().await.entries, 8);

        cache.resize(3).await;
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.capacity, 3);
    }

    #[tokio::test]
    async fn test_byte_budget_enforced() {
        let cache = ResponseCache::new(100, Some(64));
        cache
            .get_or_compute("big-1", || async { Ok("x".repeat(40)) })
            .await
            .unwrap();
        cache
            .get_or_compute("big-2", || async { Ok("y".repeat(40)) })
            .await
            .unwrap();

        let stats = cache.stats().await;
        assert!(stats.total_bytes <= 64, "byte budget exceeded: {}", stats.total_bytes);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_set_byte_budget_evicts_immediately() {
        let cache = ResponseCache::new(100, None);
        cache
            .get_or_compute("one", || async { Ok("a".repeat(30)) })
            .await
            .unwrap();
        cache
            .get_or_compute("two", || async { Ok("b".repeat(30)) })
            .await
            .unwrap();
        assert_eq!(cache.stats().await.entries, 2);

        cache.set_byte_budget(Some(40)).await;
        let stats = cache.stats().await;
        assert!(stats.total_bytes <= 40);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_invalidate_frees_entry() {
        let cache = ResponseCache::new(8, None);
        cache
            .get_or_compute("gone", || async { Ok("stale".to_string()) })
            .await
            .unwrap();
        cache.invalidate("gone").await;

        let out = cache
            .get_or_compute("gone", || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(out.response, "fresh");
        assert!(!out.hit);
    }

    #[tokio::test]
    async fn test_occupancy_ratio() {
        let cache = ResponseCache::new(4, None);
        cache
            .get_or_compute("one", || async { Ok("1".to_string()) })
            .await
            .unwrap();
        let stats = cache.stats().await;
        assert!((stats.occupancy_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_clear_removes_all_entries() {
        let cache = ResponseCache::new(8, None);
        for i in 0..4 {
            cache
                .get_or_compute(&format!("k{i}"), move || async move { Ok("v".to_string()) })
                .await
                .unwrap();
        }
        cache.clear().await;
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_bytes, 0);
    }
}
