//! Scan-wide counters.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Immutable snapshot of engine counters, readable after `finish`.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    /// Chunks handed to the detector pool.
    pub chunks_scanned: u64,
    /// Bytes handed to the detector pool.
    pub bytes_scanned: u64,
    /// Findings dispatched with verified status.
    pub verified_secrets: u64,
    /// Findings dispatched with unverified status.
    pub unverified_secrets: u64,
    /// Findings dispatched with unknown status.
    pub unknown_secrets: u64,
    /// Findings relabelled by a result filter.
    pub filtered_secrets: u64,
    /// Verification attempts that hit the per-detector timeout.
    pub detector_timeouts: u64,
    /// Chunks where the two span strategies disagreed (compare mode).
    pub span_mismatches: u64,
    /// Wall-clock duration of the scan.
    #[serde(with = "duration_ms")]
    pub scan_duration: Duration,
}

mod duration_ms {
    use super::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }
}

/// Shared mutable counters behind atomics.
pub(crate) struct MetricsInner {
    pub chunks_scanned: AtomicU64,
    pub bytes_scanned: AtomicU64,
    pub verified_secrets: AtomicU64,
    pub unverified_secrets: AtomicU64,
    pub unknown_secrets: AtomicU64,
    pub filtered_secrets: AtomicU64,
    pub detector_timeouts: AtomicU64,
    pub span_mismatches: AtomicU64,
    pub found_results: AtomicBool,
    started: Instant,
    finished: Mutex<Option<Duration>>,
    detector_nanos: Mutex<HashMap<&'static str, (u64, u64)>>,
}

impl MetricsInner {
    pub fn new() -> Self {
        Self {
            chunks_scanned: AtomicU64::new(0),
            bytes_scanned: AtomicU64::new(0),
            verified_secrets: AtomicU64::new(0),
            unverified_secrets: AtomicU64::new(0),
            unknown_secrets: AtomicU64::new(0),
            filtered_secrets: AtomicU64::new(0),
            detector_timeouts: AtomicU64::new(0),
            span_mismatches: AtomicU64::new(0),
            found_results: AtomicBool::new(false),
            started: Instant::now(),
            finished: Mutex::new(None),
            detector_nanos: Mutex::new(HashMap::new()),
        }
    }

    /// Freezes the scan duration; later calls keep the first value.
    pub fn mark_finished(&self) {
        #[expect(clippy::unwrap_used, reason = "metrics locks are never poisoned by design")]
        let mut finished = self.finished.lock().unwrap();
        if finished.is_none() {
            *finished = Some(self.started.elapsed());
        }
    }

    /// Adds one timing sample for a detector.
    pub fn record_detector_time(&self, detector: &'static str, elapsed: Duration) {
        #[expect(clippy::unwrap_used, reason = "metrics locks are never poisoned by design")]
        let mut timings = self.detector_nanos.lock().unwrap();
        let entry = timings.entry(detector).or_insert((0, 0));
        entry.0 += elapsed.as_nanos() as u64;
        entry.1 += 1;
    }

    pub fn snapshot(&self) -> Metrics {
        #[expect(clippy::unwrap_used, reason = "metrics locks are never poisoned by design")]
        let finished = *self.finished.lock().unwrap();
        Metrics {
            chunks_scanned: self.chunks_scanned.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
            verified_secrets: self.verified_secrets.load(Ordering::Relaxed),
            unverified_secrets: self.unverified_secrets.load(Ordering::Relaxed),
            unknown_secrets: self.unknown_secrets.load(Ordering::Relaxed),
            filtered_secrets: self.filtered_secrets.load(Ordering::Relaxed),
            detector_timeouts: self.detector_timeouts.load(Ordering::Relaxed),
            span_mismatches: self.span_mismatches.load(Ordering::Relaxed),
            scan_duration: finished.unwrap_or_else(|| self.started.elapsed()),
        }
    }

    /// Average processing time per detector, keyed by detector name.
    pub fn detector_averages(&self) -> HashMap<&'static str, Duration> {
        #[expect(clippy::unwrap_used, reason = "metrics locks are never poisoned by design")]
        let timings = self.detector_nanos.lock().unwrap();
        timings
            .iter()
            .filter(|(_, (_, count))| *count > 0)
            .map(|(name, (nanos, count))| (*name, Duration::from_nanos(nanos / count)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counter_updates() {
        let metrics = MetricsInner::new();
        metrics.chunks_scanned.fetch_add(3, Ordering::Relaxed);
        metrics.bytes_scanned.fetch_add(1024, Ordering::Relaxed);
        metrics.verified_secrets.fetch_add(1, Ordering::Relaxed);

        let snap = metrics.snapshot();
        assert_eq!(snap.chunks_scanned, 3);
        assert_eq!(snap.bytes_scanned, 1024);
        assert_eq!(snap.verified_secrets, 1);
    }

    #[test]
    fn mark_finished_freezes_the_duration() {
        let metrics = MetricsInner::new();
        metrics.mark_finished();
        let first = metrics.snapshot().scan_duration;
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(metrics.snapshot().scan_duration, first);
    }

    #[test]
    fn detector_averages_divide_total_by_sample_count() {
        let metrics = MetricsInner::new();
        metrics.record_detector_time("github", Duration::from_millis(10));
        metrics.record_detector_time("github", Duration::from_millis(30));

        let averages = metrics.detector_averages();
        assert_eq!(averages["github"], Duration::from_millis(20));
    }

    #[test]
    fn detector_averages_are_empty_without_samples() {
        let metrics = MetricsInner::new();
        assert!(metrics.detector_averages().is_empty());
    }
}
