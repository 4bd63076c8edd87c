//! The engine façade: wires the source manager, detector pool,
//! verification cache, and dispatcher, and owns the scan lifecycle.
//!
//! Lifecycle: `Configured -> Started -> Finishing -> Done`. Scan methods
//! are legal only while started; `finish` is idempotent and returns the
//! cancellation cause when the scan was cancelled.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rummage_detectors::{Detector, DetectorRegistry, USER_AGENT};

use crate::cache::{CacheMetrics, VerificationCache};
use crate::chunk::Chunk;
use crate::dispatch::{Dispatcher, PlainTextSink};
use crate::error::EngineError;
use crate::executor::{Executor, ExecutorConfig, SpanPolicy};
use crate::filters::ResultPolicy;
use crate::finding::FindingStatus;
use crate::handler::HandlerLimits;
use crate::metrics::{Metrics, MetricsInner};
use crate::source::{
    FilesystemConfig, FilesystemSource, GitConfig, GitSource, JobProgressRef, ManagerConfig, Source, SourceManager,
    UnitMetrics,
};

const DEFAULT_CHUNK_BUFFER: usize = 64;
const DEFAULT_DETECTOR_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_VERIFIER_PERMITS: usize = 8;

const STATE_CONFIGURED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_FINISHING: u8 = 2;
const STATE_DONE: u8 = 3;

fn state_name(state: u8) -> &'static str {
    match state {
        STATE_CONFIGURED => "configured",
        STATE_STARTED => "started",
        STATE_FINISHING => "finishing",
        _ => "done",
    }
}

/// Engine construction parameters.
///
/// Feature toggles are snapshotted here at construction; the core keeps
/// no process-global mutable state.
pub struct EngineConfig {
    /// Detector worker count. Defaults to the host CPU count.
    pub concurrency: usize,
    /// Comma-separated include selectors (`"all"`, names, ids, ranges).
    pub include_detectors: String,
    /// Comma-separated exclude selectors; always wins over include.
    pub exclude_detectors: String,
    /// Extra detectors appended to the built-in catalogue.
    pub custom_detectors: Vec<Arc<dyn Detector>>,
    /// `(selector, url)` pairs replacing default verification endpoints.
    pub verifier_endpoints: Vec<(String, String)>,
    /// Skip default endpoints for detectors with custom ones.
    pub custom_verifiers_only: bool,
    /// Attempt live verification of candidates.
    pub verify: bool,
    /// Verify the same raw bytes once per matching detector instead of
    /// keeping only the most specific match.
    pub verification_overlap: bool,
    /// Budget for one detector's verification of one chunk.
    pub detector_timeout: Duration,
    /// Entropy floor for unverified findings.
    pub filter_entropy: Option<f64>,
    /// Keep only the first unverified finding per (chunk, detector).
    pub filter_unverified: bool,
    /// Result-kind projection; empty keeps all.
    pub results: HashSet<FindingStatus>,
    /// Which byte window detectors see.
    pub span_policy: SpanPolicy,
    /// How many sources may be mid-scan at once.
    pub max_concurrent_sources: usize,
    /// Total units in flight across all sources.
    pub max_concurrent_units: usize,
    /// Chunk channel capacity; sends beyond it block the producer.
    pub chunk_buffer: usize,
    /// Archive/binary handling budgets.
    pub handler: HandlerLimits,
    /// Memoize verification outcomes for the scan.
    pub verification_cache: bool,
    /// Concurrent outbound verifications per detector.
    pub verifier_permits: usize,
    /// Appended to the verification `User-Agent`.
    pub user_agent_suffix: Option<String>,
    /// Sink receiving findings.
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Optional channel receiving one record per completed unit.
    pub unit_metrics: Option<mpsc::Sender<UnitMetrics>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(4, std::num::NonZero::get);
        Self {
            concurrency: cpus,
            include_detectors: "all".to_string(),
            exclude_detectors: String::new(),
            custom_detectors: Vec::new(),
            verifier_endpoints: Vec::new(),
            custom_verifiers_only: false,
            verify: true,
            verification_overlap: false,
            detector_timeout: DEFAULT_DETECTOR_TIMEOUT,
            filter_entropy: None,
            filter_unverified: false,
            results: HashSet::new(),
            span_policy: SpanPolicy::default(),
            max_concurrent_sources: cpus,
            max_concurrent_units: cpus,
            chunk_buffer: DEFAULT_CHUNK_BUFFER,
            handler: HandlerLimits::default(),
            verification_cache: true,
            verifier_permits: DEFAULT_VERIFIER_PERMITS,
            user_agent_suffix: None,
            dispatcher: Arc::new(PlainTextSink::new(std::io::stdout())),
            unit_metrics: None,
        }
    }
}

/// The credential-discovery engine.
pub struct Engine {
    state: AtomicU8,
    cancel: CancellationToken,
    manager: SourceManager,
    executor: Arc<Executor>,
    chunk_rx: std::sync::Mutex<Option<mpsc::Receiver<Chunk>>>,
    workers: std::sync::Mutex<JoinSet<()>>,
    concurrency: usize,
    metrics: Arc<MetricsInner>,
    cache: Option<Arc<VerificationCache>>,
    finish_outcome: tokio::sync::Mutex<Option<Result<(), String>>>,
}

impl Engine {
    /// Builds an engine from its configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid detector selections, bad verifier
    /// endpoints, or an HTTP client that fails to construct.
    pub fn new(cfg: EngineConfig) -> Result<Self, EngineError> {
        let mut detectors = rummage_detectors::detectors::builtin_detectors();
        detectors.extend(cfg.custom_detectors);

        let mut registry = DetectorRegistry::with_detectors(detectors)?
            .filtered(&cfg.include_detectors, &cfg.exclude_detectors)?;
        for (selector, url) in &cfg.verifier_endpoints {
            registry.set_verifier_endpoints(selector, vec![url.clone()])?;
        }
        registry.set_custom_verifiers_only(cfg.custom_verifiers_only);
        debug!(detectors = registry.len(), "detector registry assembled");

        let user_agent = match &cfg.user_agent_suffix {
            Some(suffix) => format!("{USER_AGENT} {suffix}"),
            None => USER_AGENT.to_string(),
        };
        let client = reqwest::Client::builder()
            .timeout(cfg.detector_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| EngineError::Client(e.to_string()))?;

        let cancel = CancellationToken::new();
        let (manager, chunk_rx) = SourceManager::new(
            ManagerConfig {
                max_concurrent_sources: cfg.max_concurrent_sources.max(1),
                max_concurrent_units: cfg.max_concurrent_units.max(1),
                chunk_buffer: cfg.chunk_buffer.max(1),
                limits: cfg.handler,
                unit_metrics: cfg.unit_metrics,
            },
            cancel.clone(),
        );

        let cache = cfg.verification_cache.then(|| Arc::new(VerificationCache::new()));
        let metrics = Arc::new(MetricsInner::new());

        let executor = Arc::new(Executor::new(
            Arc::new(registry),
            ExecutorConfig {
                verify: cfg.verify,
                verification_overlap: cfg.verification_overlap,
                detector_timeout: cfg.detector_timeout,
                span_policy: cfg.span_policy,
                policy: ResultPolicy {
                    filter_entropy: cfg.filter_entropy,
                    filter_unverified: cfg.filter_unverified,
                    results: cfg.results,
                },
                verifier_permits: cfg.verifier_permits.max(1),
            },
            client,
            cache.clone(),
            cfg.dispatcher,
            Arc::clone(&metrics),
            manager.clone(),
        ));

        Ok(Self {
            state: AtomicU8::new(STATE_CONFIGURED),
            cancel,
            manager,
            executor,
            chunk_rx: std::sync::Mutex::new(Some(chunk_rx)),
            workers: std::sync::Mutex::new(JoinSet::new()),
            concurrency: cfg.concurrency.max(1),
            metrics,
            cache,
            finish_outcome: tokio::sync::Mutex::new(None),
        })
    }

    /// Launches the detector workers. Legal exactly once, before any scan.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] when called twice or after
    /// `finish`.
    pub fn start(&self) -> Result<(), EngineError> {
        self.transition(STATE_CONFIGURED, STATE_STARTED, "start")?;

        #[expect(clippy::unwrap_used, reason = "engine locks are never poisoned by design")]
        let chunk_rx = self.chunk_rx.lock().unwrap().take();
        // The receiver is present exactly when the state transition above
        // succeeded.
        let Some(chunk_rx) = chunk_rx else {
            return Err(EngineError::InvalidState {
                operation: "start",
                state: state_name(self.state.load(Ordering::SeqCst)),
            });
        };

        let shared_rx = Arc::new(tokio::sync::Mutex::new(chunk_rx));
        #[expect(clippy::unwrap_used, reason = "engine locks are never poisoned by design")]
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..self.concurrency {
            let executor = Arc::clone(&self.executor);
            let rx = Arc::clone(&shared_rx);
            let cancel = self.cancel.clone();
            workers.spawn(executor.run_worker(rx, cancel));
        }
        debug!(workers = self.concurrency, "detector pool started");
        Ok(())
    }

    /// Enrols a filesystem source and returns its progress handle.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when the engine is not started.
    pub fn scan_filesystem(&self, cfg: FilesystemConfig) -> Result<JobProgressRef, EngineError> {
        let source = FilesystemSource::new(cfg)?;
        self.scan_source(Arc::new(source))
    }

    /// Enrols a git source and returns its progress handle.
    ///
    /// With `base_ref` set, history replays oldest-first; run the engine
    /// with `concurrency = 1` to preserve that order through detection.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when the engine is not started.
    pub fn scan_git(&self, cfg: GitConfig) -> Result<JobProgressRef, EngineError> {
        let source = GitSource::new(cfg)?;
        self.scan_source(Arc::new(source))
    }

    /// Enrols any source implementation and returns its progress handle.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] unless the engine is started.
    pub fn scan_source(&self, source: Arc<dyn Source>) -> Result<JobProgressRef, EngineError> {
        let state = self.state.load(Ordering::SeqCst);
        if state != STATE_STARTED {
            return Err(EngineError::InvalidState {
                operation: "scan",
                state: state_name(state),
            });
        }

        self.manager
            .enroll(source, self.executor_verifies())
            .ok_or(EngineError::InvalidState {
                operation: "scan",
                state: "finishing",
            })
    }

    /// Requests cooperative teardown of the scan.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns a token that observes (and can trigger) scan cancellation.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for all enrolled sources to terminate, closes the chunk
    /// channel, and drains the detector workers. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cancelled`] when the scan was cancelled;
    /// the same outcome is repeated on later calls.
    pub async fn finish(&self) -> Result<(), EngineError> {
        let mut outcome = self.finish_outcome.lock().await;
        if let Some(previous) = outcome.as_ref() {
            return previous.clone().map_err(EngineError::Cancelled);
        }

        self.transition(STATE_STARTED, STATE_FINISHING, "finish")?;

        self.manager.wait_for_sources().await;
        self.manager.close_intake();

        #[expect(clippy::unwrap_used, reason = "engine locks are never poisoned by design")]
        let mut workers = std::mem::take(&mut *self.workers.lock().unwrap());
        while workers.join_next().await.is_some() {}

        self.metrics.mark_finished();
        self.state.store(STATE_DONE, Ordering::SeqCst);

        let result = if self.cancel.is_cancelled() {
            Err("scan cancelled".to_string())
        } else {
            Ok(())
        };
        *outcome = Some(result.clone());
        result.map_err(EngineError::Cancelled)
    }

    /// Returns the scan-wide counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> Metrics {
        self.metrics.snapshot()
    }

    /// Returns average processing time per detector.
    #[must_use]
    pub fn detector_metrics(&self) -> std::collections::HashMap<&'static str, Duration> {
        self.metrics.detector_averages()
    }

    /// Returns verification-cache counters when caching is enabled.
    #[must_use]
    pub fn cache_metrics(&self) -> Option<CacheMetrics> {
        self.cache.as_ref().map(|cache| cache.metrics())
    }

    /// Returns `true` once any finding has been dispatched.
    #[must_use]
    pub fn has_found_results(&self) -> bool {
        self.metrics.found_results.load(Ordering::Relaxed)
    }

    /// Returns progress handles for every enrolled source.
    #[must_use]
    pub fn progresses(&self) -> Vec<JobProgressRef> {
        self.manager.progresses()
    }

    fn executor_verifies(&self) -> bool {
        // The chunk-level verify flag mirrors the engine toggle; adapters
        // do not override it today.
        true
    }

    fn transition(&self, from: u8, to: u8, operation: &'static str) -> Result<(), EngineError> {
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| EngineError::InvalidState {
                operation,
                state: state_name(actual),
            })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &state_name(self.state.load(Ordering::SeqCst)))
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            verify: false,
            dispatcher: Arc::new(crate::testing::CollectingSink::new()),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn scan_before_start_is_rejected() {
        let engine = Engine::new(quiet_config()).unwrap();
        let err = engine
            .scan_filesystem(FilesystemConfig {
                paths: vec![std::path::PathBuf::from(".")],
                ..FilesystemConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let engine = Engine::new(quiet_config()).unwrap();
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::InvalidState { .. })));
        engine.finish().await.unwrap();
    }

    #[tokio::test]
    async fn finish_before_start_is_rejected() {
        let engine = Engine::new(quiet_config()).unwrap();
        let err = engine.finish().await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let engine = Engine::new(quiet_config()).unwrap();
        engine.start().unwrap();
        engine.finish().await.unwrap();
        engine.finish().await.unwrap();
    }

    #[tokio::test]
    async fn empty_detector_selection_fails_construction() {
        let cfg = EngineConfig {
            include_detectors: "github".to_string(),
            exclude_detectors: "github".to_string(),
            ..quiet_config()
        };
        assert!(Engine::new(cfg).is_err());
    }

    #[tokio::test]
    async fn cancelled_scan_reports_the_cause_from_finish() {
        let engine = Engine::new(quiet_config()).unwrap();
        engine.start().unwrap();
        engine.cancel();
        let err = engine.finish().await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(_)));
    }
}
