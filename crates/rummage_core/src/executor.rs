//! The detector executor: fan-out of chunks to detectors.
//!
//! A fixed pool of workers drains the chunk channel. For every chunk a
//! worker pre-filters detectors by keyword, runs the survivors under the
//! span policy, resolves cross-detector overlaps, verifies candidates
//! through the cache, applies the result filters, and dispatches what is
//! left. Each worker processes one chunk to completion before taking the
//! next.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aho_corasick::AhoCorasick;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use rummage_detectors::{Candidate, Detector, DetectorId, DetectorRegistry, VerifierOutcome};

use crate::cache::{CacheKey, CachedVerification, VerificationCache};
use crate::chunk::{Chunk, bytecount};
use crate::dispatch::Dispatcher;
use crate::filters::ResultPolicy;
use crate::finding::{Finding, FindingStatus, redact};
use crate::metrics::MetricsInner;
use crate::source::SourceManager;

/// Bytes of context kept before the first keyword hit when windowing.
const SPAN_PRE_CONTEXT: usize = 64;

/// Window length examined after the first keyword hit.
const SPAN_MAX_MATCH: usize = 1536;

/// Which byte window a detector sees for each chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SpanPolicy {
    /// Slice a bounded window around the first keyword hit (the default).
    #[default]
    MaxLength,
    /// Hand every detector the entire chunk.
    EntireChunk,
    /// Run both strategies and require their finding counts to agree.
    Compare,
}

pub(crate) struct ExecutorConfig {
    pub verify: bool,
    pub verification_overlap: bool,
    pub detector_timeout: Duration,
    pub span_policy: SpanPolicy,
    pub policy: ResultPolicy,
    pub verifier_permits: usize,
}

/// Keyword pre-filter shared by all workers.
///
/// One case-insensitive automaton is built over every enabled detector's
/// keywords; a chunk selects a detector either through a keyword hit or
/// because the detector declares no keywords at all.
struct KeywordIndex {
    automaton: Option<AhoCorasick>,
    keyword_to_detectors: Vec<Vec<usize>>,
    detectors_without_keywords: Vec<usize>,
    /// Longest declared keyword per detector, the overlap specificity.
    specificity: Vec<usize>,
}

impl KeywordIndex {
    fn build(detectors: &[Arc<dyn Detector>]) -> Self {
        let mut keywords: Vec<String> = Vec::new();
        let mut keyword_to_detectors: Vec<Vec<usize>> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut detectors_without_keywords = Vec::new();
        let mut specificity = Vec::with_capacity(detectors.len());

        for (detector_idx, detector) in detectors.iter().enumerate() {
            let declared = detector.keywords();
            specificity.push(declared.iter().map(|k| k.len()).max().unwrap_or(0));

            if declared.is_empty() {
                detectors_without_keywords.push(detector_idx);
                continue;
            }
            for keyword in declared {
                let keyword = keyword.to_string();
                if let Some(&existing) = positions.get(&keyword) {
                    keyword_to_detectors[existing].push(detector_idx);
                } else {
                    positions.insert(keyword.clone(), keywords.len());
                    keywords.push(keyword);
                    keyword_to_detectors.push(vec![detector_idx]);
                }
            }
        }

        let automaton = if keywords.is_empty() {
            None
        } else {
            AhoCorasick::builder()
                .ascii_case_insensitive(true)
                .build(&keywords)
                .ok()
        };

        Self {
            automaton,
            keyword_to_detectors,
            detectors_without_keywords,
            specificity,
        }
    }

    /// Returns `(detector index, first keyword hit offset)` for every
    /// detector that should run against `data`. Keywordless detectors
    /// are returned with no hit offset.
    fn select(&self, data: &[u8]) -> Vec<(usize, Option<usize>)> {
        let mut first_hit: HashMap<usize, usize> = HashMap::new();

        if let Some(automaton) = &self.automaton {
            for mat in automaton.find_iter(data) {
                for &detector_idx in &self.keyword_to_detectors[mat.pattern().as_usize()] {
                    first_hit.entry(detector_idx).or_insert(mat.start());
                }
            }
        }

        let mut selected: Vec<(usize, Option<usize>)> =
            first_hit.into_iter().map(|(idx, hit)| (idx, Some(hit))).collect();
        selected.extend(self.detectors_without_keywords.iter().map(|&idx| (idx, None)));
        selected.sort_unstable_by_key(|(idx, _)| *idx);
        selected
    }
}

pub(crate) struct Executor {
    registry: Arc<DetectorRegistry>,
    index: KeywordIndex,
    cfg: ExecutorConfig,
    client: reqwest::Client,
    cache: Option<Arc<VerificationCache>>,
    permits: HashMap<DetectorId, Arc<Semaphore>>,
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Arc<MetricsInner>,
    manager: SourceManager,
}

impl Executor {
    pub fn new(
        registry: Arc<DetectorRegistry>,
        cfg: ExecutorConfig,
        client: reqwest::Client,
        cache: Option<Arc<VerificationCache>>,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Arc<MetricsInner>,
        manager: SourceManager,
    ) -> Self {
        let index = KeywordIndex::build(registry.detectors());
        let permits = registry
            .detectors()
            .iter()
            .filter(|d| d.verifier().is_some())
            .map(|d| (d.id(), Arc::new(Semaphore::new(cfg.verifier_permits))))
            .collect();

        Self {
            index,
            cfg,
            client,
            cache,
            permits,
            dispatcher,
            metrics,
            manager,
            registry,
        }
    }

    /// Drains the chunk channel until it closes or the scan is cancelled.
    pub async fn run_worker(self: Arc<Self>, rx: Arc<Mutex<mpsc::Receiver<Chunk>>>, cancel: CancellationToken) {
        loop {
            let chunk = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    chunk = rx.recv() => chunk,
                }
            };
            // On cancellation buffered chunks are discarded, not scanned.
            let Some(chunk) = chunk else { return };
            self.process_chunk(&chunk).await;
        }
    }

    async fn process_chunk(&self, chunk: &Chunk) {
        use std::sync::atomic::Ordering;

        self.metrics.chunks_scanned.fetch_add(1, Ordering::Relaxed);
        self.metrics.bytes_scanned.fetch_add(chunk.data.len() as u64, Ordering::Relaxed);

        let selected = self.index.select(&chunk.data);
        trace!(unit = %chunk.unit, detectors = selected.len(), "scanning chunk");

        let mut candidates: Vec<(usize, Candidate)> = Vec::new();
        for (detector_idx, first_hit) in selected {
            let detector = &self.registry.detectors()[detector_idx];
            let started = Instant::now();

            let found = std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.run_span_policy(detector.as_ref(), &chunk.data, first_hit)
            }));
            self.metrics.record_detector_time(detector.name(), started.elapsed());

            match found {
                Ok(found) => candidates.extend(found.into_iter().map(|c| (detector_idx, c))),
                Err(_panic) => {
                    self.manager.add_unit_error(
                        chunk.job_id,
                        &chunk.unit,
                        &format!("detector '{}' panicked", detector.name()),
                    );
                }
            }
        }

        let resolved = self.resolve_overlaps(candidates);

        let mut findings = Vec::with_capacity(resolved.len());
        for (detector_idx, candidate) in resolved {
            findings.push(self.build_finding(detector_idx, candidate, chunk).await);
        }

        self.cfg.policy.apply(&mut findings);

        for finding in &findings {
            match finding.status {
                FindingStatus::Verified => self.metrics.verified_secrets.fetch_add(1, Ordering::Relaxed),
                FindingStatus::Unverified => self.metrics.unverified_secrets.fetch_add(1, Ordering::Relaxed),
                FindingStatus::Unknown => self.metrics.unknown_secrets.fetch_add(1, Ordering::Relaxed),
                FindingStatus::FilteredUnverified => self.metrics.filtered_secrets.fetch_add(1, Ordering::Relaxed),
            };
            self.metrics.found_results.store(true, Ordering::Relaxed);
            self.dispatcher.dispatch(finding);
        }
    }

    fn run_span_policy(&self, detector: &dyn Detector, data: &[u8], first_hit: Option<usize>) -> Vec<Candidate> {
        match self.cfg.span_policy {
            SpanPolicy::EntireChunk => detector.from_data(data),
            SpanPolicy::MaxLength => windowed_scan(detector, data, first_hit),
            SpanPolicy::Compare => {
                let entire = detector.from_data(data);
                let windowed = windowed_scan(detector, data, first_hit);
                if entire.len() != windowed.len() {
                    warn!(
                        detector = detector.name(),
                        entire = entire.len(),
                        windowed = windowed.len(),
                        "span strategies disagree"
                    );
                    self.metrics
                        .span_mismatches
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                entire
            }
        }
    }

    /// Collapses candidates whose raw bytes coincide across detectors.
    ///
    /// The more specific detector wins: longest declared keyword first,
    /// then the lower numeric id.
    fn resolve_overlaps(&self, candidates: Vec<(usize, Candidate)>) -> Vec<(usize, Candidate)> {
        if self.cfg.verification_overlap {
            return candidates;
        }

        let mut chosen: HashMap<Box<str>, (usize, Candidate)> = HashMap::new();
        let mut order: Vec<Box<str>> = Vec::new();

        for (detector_idx, candidate) in candidates {
            match chosen.entry(candidate.raw.clone()) {
                std::collections::hash_map::Entry::Vacant(slot) => {
                    order.push(candidate.raw.clone());
                    slot.insert((detector_idx, candidate));
                }
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    if self.wins_overlap(detector_idx, slot.get().0) {
                        slot.insert((detector_idx, candidate));
                    }
                }
            }
        }

        order.into_iter().filter_map(|raw| chosen.remove(&raw)).collect()
    }

    fn wins_overlap(&self, challenger: usize, incumbent: usize) -> bool {
        let challenger_specificity = self.index.specificity[challenger];
        let incumbent_specificity = self.index.specificity[incumbent];
        if challenger_specificity != incumbent_specificity {
            return challenger_specificity > incumbent_specificity;
        }
        self.registry.detectors()[challenger].id() < self.registry.detectors()[incumbent].id()
    }

    async fn build_finding(&self, detector_idx: usize, candidate: Candidate, chunk: &Chunk) -> Finding {
        let detector = &self.registry.detectors()[detector_idx];

        let (status, verification_error, verify_extra) = self.verify_candidate(detector, &candidate, chunk).await;

        let match_line = chunk.provenance.line() + bytecount(&chunk.data[..candidate.span.start.min(chunk.data.len())], b'\n');

        let mut extra = candidate.extra;
        extra.extend(verify_extra);

        Finding {
            detector: detector.id(),
            detector_name: detector.name(),
            status,
            verification_error,
            redacted: redact(&candidate.raw).into(),
            raw: candidate.raw,
            raw_v2: candidate.raw_v2,
            extra,
            source: chunk.source.clone(),
            provenance: chunk.provenance.with_line(match_line),
            decoder: chunk.decoder,
        }
    }

    async fn verify_candidate(
        &self,
        detector: &Arc<dyn Detector>,
        candidate: &Candidate,
        chunk: &Chunk,
    ) -> (FindingStatus, Option<String>, Vec<(&'static str, String)>) {
        if !self.cfg.verify || !chunk.verify || detector.verifier().is_none() {
            return (FindingStatus::Unverified, None, Vec::new());
        }

        let id = detector.id();
        let _permit = match self.permits.get(&id) {
            Some(semaphore) => semaphore.acquire().await.ok(),
            None => None,
        };

        let outcome = tokio::time::timeout(self.cfg.detector_timeout, self.cached_verify(id, &candidate.raw)).await;

        match outcome {
            Ok(cached) => (cached.status.into(), cached.error, cached.extra),
            Err(_elapsed) => {
                self.metrics
                    .detector_timeouts
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.manager.add_unit_error(
                    chunk.job_id,
                    &chunk.unit,
                    &format!(
                        "detector '{}' timed out after {:?} during verification",
                        detector.name(),
                        self.cfg.detector_timeout
                    ),
                );
                (
                    FindingStatus::Unknown,
                    Some(format!("verification timed out after {:?}", self.cfg.detector_timeout)),
                    Vec::new(),
                )
            }
        }
    }

    async fn cached_verify(&self, id: DetectorId, raw: &str) -> CachedVerification {
        let run = || async {
            match self.registry.verify(&self.client, id, raw).await {
                Ok(outcome) => outcome_to_cached(outcome, None),
                Err(e) => CachedVerification {
                    status: rummage_detectors::Verification::Unknown,
                    extra: Vec::new(),
                    error: Some(e.to_string()),
                },
            }
        };

        match &self.cache {
            Some(cache) => cache.get_or_verify(CacheKey::new(id, raw.as_bytes()), run).await,
            None => run().await,
        }
    }
}

fn outcome_to_cached(outcome: VerifierOutcome, error: Option<String>) -> CachedVerification {
    CachedVerification {
        status: outcome.verification,
        extra: outcome.extra,
        error,
    }
}

fn windowed_scan(detector: &dyn Detector, data: &[u8], first_hit: Option<usize>) -> Vec<Candidate> {
    let Some(hit) = first_hit else {
        // Keywordless detectors have no anchor to window around.
        return detector.from_data(data);
    };

    let start = hit.saturating_sub(SPAN_PRE_CONTEXT);
    let end = (hit + SPAN_MAX_MATCH).min(data.len());

    detector
        .from_data(&data[start..end])
        .into_iter()
        .map(|mut candidate| {
            candidate.span = candidate.span.start + start..candidate.span.end + start;
            candidate
        })
        .collect()
}
