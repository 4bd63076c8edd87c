//! Per-source scan progress.
//!
//! A [`JobProgressRef`] is handed out when a source is enrolled. It is an
//! append-only log of unit lifecycle events and errors; snapshots are
//! readable at any time and completion is awaitable. The core never
//! writes errors anywhere else: this is the only surface they cross.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::chunk::{JobId, SourceKind, UnitId};

/// One error attached to a unit during a scan.
#[derive(Debug, Clone, Serialize)]
pub struct UnitError {
    /// The unit the error belongs to.
    pub unit: String,
    /// Human-readable error detail.
    pub error: String,
}

/// Point-in-time copy of a source's progress.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgressSnapshot {
    /// The job this progress belongs to.
    pub job_id: JobId,
    /// Adapter kind.
    pub kind: SourceKind,
    /// Operator-facing source name.
    pub source_name: String,
    /// Units reported by enumeration so far.
    pub units_enumerated: u64,
    /// Units whose scan has begun.
    pub units_started: u64,
    /// Units whose scan has ended (successfully or not).
    pub units_finished: u64,
    /// Chunks emitted across all units.
    pub chunks: u64,
    /// Bytes emitted across all units.
    pub bytes: u64,
    /// Errors recorded against units, in arrival order.
    pub errors: Vec<UnitError>,
    /// Whether enumeration has finished.
    pub enumeration_done: bool,
    /// Fatal enumeration failure, if the source died before scanning.
    pub source_failure: Option<String>,
    /// When the source was enrolled.
    pub started_at: DateTime<Utc>,
    /// When the last unit finished, once the source is done.
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobProgressSnapshot {
    /// Returns `true` once every enumerated unit has finished (or the
    /// source failed fatally).
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.source_failure.is_some() || (self.enumeration_done && self.units_finished >= self.units_enumerated)
    }
}

/// Per-unit record emitted on the optional metrics channel when a unit
/// completes. Consumers render these as the JSON scan report.
#[derive(Debug, Clone, Serialize)]
pub struct UnitMetrics {
    /// Operator-facing source name.
    pub source_name: String,
    /// The unit that completed.
    pub unit: String,
    /// When the unit's scan began.
    pub started_at: DateTime<Utc>,
    /// When the unit's scan ended.
    pub finished_at: DateTime<Utc>,
    /// Bytes the unit emitted.
    pub bytes: u64,
    /// Chunks the unit emitted.
    pub chunks: u64,
    /// Errors recorded against the unit.
    pub errors: Vec<String>,
}

#[derive(Debug)]
struct ProgressState {
    units_enumerated: u64,
    units_started: u64,
    units_finished: u64,
    chunks: u64,
    bytes: u64,
    errors: Vec<UnitError>,
    enumeration_done: bool,
    source_failure: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct ProgressInner {
    job_id: JobId,
    kind: SourceKind,
    source_name: Arc<str>,
    started_at: DateTime<Utc>,
    state: Mutex<ProgressState>,
    done_tx: watch::Sender<bool>,
}

/// Shared handle to one source's append-only progress log.
#[derive(Debug, Clone)]
pub struct JobProgressRef {
    inner: Arc<ProgressInner>,
}

impl JobProgressRef {
    pub(crate) fn new(job_id: JobId, kind: SourceKind, source_name: Arc<str>) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ProgressInner {
                job_id,
                kind,
                source_name,
                started_at: Utc::now(),
                state: Mutex::new(ProgressState {
                    units_enumerated: 0,
                    units_started: 0,
                    units_finished: 0,
                    chunks: 0,
                    bytes: 0,
                    errors: Vec::new(),
                    enumeration_done: false,
                    source_failure: None,
                    finished_at: None,
                }),
                done_tx,
            }),
        }
    }

    /// Returns the job id this progress belongs to.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.inner.job_id
    }

    /// Takes a point-in-time copy of the progress.
    ///
    /// # Panics
    ///
    /// Panics if a progress writer panicked while holding the state lock.
    #[must_use]
    pub fn snapshot(&self) -> JobProgressSnapshot {
        #[expect(clippy::unwrap_used, reason = "progress lock is never poisoned by design")]
        let state = self.inner.state.lock().unwrap();
        JobProgressSnapshot {
            job_id: self.inner.job_id,
            kind: self.inner.kind,
            source_name: self.inner.source_name.to_string(),
            units_enumerated: state.units_enumerated,
            units_started: state.units_started,
            units_finished: state.units_finished,
            chunks: state.chunks,
            bytes: state.bytes,
            errors: state.errors.clone(),
            enumeration_done: state.enumeration_done,
            source_failure: state.source_failure.clone(),
            started_at: self.inner.started_at,
            finished_at: state.finished_at,
        }
    }

    /// Waits until the source has finished all units or failed.
    pub async fn done(&self) {
        let mut rx = self.inner.done_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        // The sender lives as long as self, so changed() cannot fail here.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Returns `true` once the source has finished or failed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.inner.done_tx.subscribe().borrow()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ProgressState) -> T) -> T {
        #[expect(clippy::unwrap_used, reason = "progress lock is never poisoned by design")]
        let mut state = self.inner.state.lock().unwrap();
        let result = f(&mut state);
        let done = state.source_failure.is_some()
            || (state.enumeration_done && state.units_finished >= state.units_enumerated);
        if done {
            if state.finished_at.is_none() {
                state.finished_at = Some(Utc::now());
            }
            self.inner.done_tx.send_replace(true);
        }
        result
    }

    pub(crate) fn unit_enumerated(&self) {
        self.with_state(|s| s.units_enumerated += 1);
    }

    pub(crate) fn unit_started(&self) {
        self.with_state(|s| s.units_started += 1);
    }

    pub(crate) fn unit_finished(&self) {
        self.with_state(|s| s.units_finished += 1);
    }

    pub(crate) fn add_chunk(&self, bytes: u64) {
        self.with_state(|s| {
            s.chunks += 1;
            s.bytes += bytes;
        });
    }

    /// Attaches an error to a unit without failing the scan.
    pub fn add_unit_error(&self, unit: &UnitId, error: impl Into<String>) {
        self.with_state(|s| {
            s.errors.push(UnitError {
                unit: unit.to_string(),
                error: error.into(),
            });
        });
    }

    pub(crate) fn enumeration_finished(&self) {
        self.with_state(|s| s.enumeration_done = true);
    }

    pub(crate) fn fail_source(&self, error: impl Into<String>) {
        self.with_state(|s| s.source_failure = Some(error.into()));
    }
}
