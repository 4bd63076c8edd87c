//! In-memory memoization of verification outcomes.
//!
//! Keyed by (detector, credential fingerprint), the cache collapses
//! concurrent verifications of the same credential into a single live
//! check and answers every later attempt within the scan from memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};

use rummage_detectors::{DetectorId, Verification};

/// Cache key: detector plus a digest of the canonical credential bytes.
///
/// The raw credential never lives in the cache; only its SHA-256 does.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    detector: DetectorId,
    fingerprint: [u8; 32],
}

impl CacheKey {
    /// Builds a key from the detector and the credential's raw bytes.
    #[must_use]
    pub fn new(detector: DetectorId, raw: &[u8]) -> Self {
        Self {
            detector,
            fingerprint: Sha256::digest(raw).into(),
        }
    }
}

impl std::fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheKey({}, {})", self.detector, &hex::encode(self.fingerprint)[..12])
    }
}

/// A memoized verification outcome.
#[derive(Debug, Clone)]
pub struct CachedVerification {
    /// The verifier's conclusion.
    pub status: Verification,
    /// Structured fields learned during the check.
    pub extra: Vec<(&'static str, String)>,
    /// Error annotation when the check failed or timed out.
    pub error: Option<String>,
}

/// Counters describing cache effectiveness over a scan.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheMetrics {
    /// Lookups answered from memory.
    pub hits: u64,
    /// Lookups that triggered a live check.
    pub misses: u64,
    /// Cached outcomes later contradicted by a fresh live check.
    pub wasted_hits: u64,
    /// Live checks avoided (one per hit).
    pub attempts_saved: u64,
    /// Total wall-clock time spent inside live checks, in milliseconds.
    pub verify_time_ms: u64,
}

/// Process-local verification memo with per-key at-most-once in-flight
/// coordination.
#[derive(Default)]
pub struct VerificationCache {
    entries: Mutex<HashMap<CacheKey, Arc<OnceCell<CachedVerification>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    wasted_hits: AtomicU64,
    verify_nanos: AtomicU64,
}

impl VerificationCache {
    /// Creates an empty cache. Unbounded; it lives for a single scan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached outcome for `key`, or runs `verify` to produce
    /// it. Concurrent callers with the same key share one in-flight
    /// check; all of them receive its result.
    pub async fn get_or_verify<F, Fut>(&self, key: CacheKey, verify: F) -> CachedVerification
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CachedVerification>,
    {
        let cell = {
            let mut entries = self.entries.lock().await;
            Arc::clone(entries.entry(key).or_default())
        };

        let mut ran_live = false;
        let outcome = cell
            .get_or_init(|| async {
                ran_live = true;
                self.misses.fetch_add(1, Ordering::Relaxed);
                let start = Instant::now();
                let outcome = verify().await;
                self.verify_nanos
                    .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                outcome
            })
            .await
            .clone();

        if !ran_live {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Runs a fresh live check and compares it with the cached outcome,
    /// replacing the entry and counting a wasted hit when the result
    /// flipped. Used to validate cache soundness.
    ///
    /// Returns `true` when the cached outcome still matched.
    pub async fn reverify<F, Fut>(&self, key: CacheKey, verify: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CachedVerification>,
    {
        let start = Instant::now();
        let fresh = verify().await;
        self.verify_nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);

        let mut entries = self.entries.lock().await;
        let previous = entries.get(&key).and_then(|cell| cell.get().cloned());

        let sound = previous.as_ref().is_none_or(|cached| cached.status == fresh.status);
        if !sound {
            self.wasted_hits.fetch_add(1, Ordering::Relaxed);
        }

        let cell = OnceCell::new();
        // A freshly created cell cannot already be initialised.
        let _ = cell.set(fresh);
        entries.insert(key, Arc::new(cell));
        sound
    }

    /// Takes a point-in-time copy of the cache counters.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        CacheMetrics {
            hits,
            misses: self.misses.load(Ordering::Relaxed),
            wasted_hits: self.wasted_hits.load(Ordering::Relaxed),
            attempts_saved: hits,
            verify_time_ms: self.verify_nanos.load(Ordering::Relaxed) / 1_000_000,
        }
    }
}

impl std::fmt::Debug for VerificationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationCache")
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn verified() -> CachedVerification {
        CachedVerification {
            status: Verification::Verified,
            extra: Vec::new(),
            error: None,
        }
    }

    fn unverified() -> CachedVerification {
        CachedVerification {
            status: Verification::Unverified,
            extra: Vec::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn first_lookup_is_a_miss_and_runs_the_check() {
        let cache = VerificationCache::new();
        let key = CacheKey::new(DetectorId(1), b"secret");

        let outcome = cache.get_or_verify(key, || async { verified() }).await;
        assert_eq!(outcome.status, Verification::Verified);

        let metrics = cache.metrics();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 0);
    }

    #[tokio::test]
    async fn repeat_lookup_is_answered_from_memory() {
        let cache = VerificationCache::new();
        let key = CacheKey::new(DetectorId(1), b"secret");
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let outcome = cache
                .get_or_verify(key, || async {
                    calls.fetch_add(1, Ordering::Relaxed);
                    verified()
                })
                .await;
            assert_eq!(outcome.status, Verification::Verified);
        }

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        let metrics = cache.metrics();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 2);
        assert_eq!(metrics.attempts_saved, 2);
    }

    #[tokio::test]
    async fn concurrent_misses_for_one_key_collapse_to_a_single_check() {
        let cache = Arc::new(VerificationCache::new());
        let key = CacheKey::new(DetectorId(2), b"shared-secret");
        let calls = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_verify(key, move || async move {
                        calls.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        verified()
                    })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().status, Verification::Verified);
        }

        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn different_credentials_get_independent_entries() {
        let cache = VerificationCache::new();
        let key_a = CacheKey::new(DetectorId(1), b"secret-a");
        let key_b = CacheKey::new(DetectorId(1), b"secret-b");

        cache.get_or_verify(key_a, || async { verified() }).await;
        let outcome = cache.get_or_verify(key_b, || async { unverified() }).await;

        assert_eq!(outcome.status, Verification::Unverified);
        assert_eq!(cache.metrics().misses, 2);
    }

    #[tokio::test]
    async fn same_credential_under_different_detectors_is_two_keys() {
        let cache = VerificationCache::new();
        cache
            .get_or_verify(CacheKey::new(DetectorId(1), b"x"), || async { verified() })
            .await;
        cache
            .get_or_verify(CacheKey::new(DetectorId(2), b"x"), || async { verified() })
            .await;
        assert_eq!(cache.metrics().misses, 2);
    }

    #[tokio::test]
    async fn reverify_counts_a_wasted_hit_when_the_outcome_flips() {
        let cache = VerificationCache::new();
        let key = CacheKey::new(DetectorId(1), b"rotating");

        cache.get_or_verify(key, || async { verified() }).await;
        let sound = cache.reverify(key, || async { unverified() }).await;

        assert!(!sound);
        assert_eq!(cache.metrics().wasted_hits, 1);

        // The replacement is now the source of truth.
        let outcome = cache.get_or_verify(key, || async { verified() }).await;
        assert_eq!(outcome.status, Verification::Unverified);
    }

    #[tokio::test]
    async fn reverify_of_a_stable_outcome_is_sound() {
        let cache = VerificationCache::new();
        let key = CacheKey::new(DetectorId(1), b"stable");

        cache.get_or_verify(key, || async { verified() }).await;
        assert!(cache.reverify(key, || async { verified() }).await);
        assert_eq!(cache.metrics().wasted_hits, 0);
    }
}
