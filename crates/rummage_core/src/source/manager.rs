//! Scheduling of sources and their units.
//!
//! The manager owns the two concurrency budgets of the scan: how many
//! sources may be mid-scan and how many units may be in flight across all
//! of them. Each enrolled source gets a supervisor task that drives
//! enumeration and spawns one worker per unit; worker failures and panics
//! are recorded on the source's progress and never abort the scan.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chunk::{Chunk, JobId, SourceDescriptor, UnitId};
use crate::error::SourceError;
use crate::handler::HandlerLimits;
use crate::source::emitter::ChunkEmitter;
use crate::source::progress::{JobProgressRef, UnitMetrics};
use crate::source::{Source, SourceUnit, UnitReporter};

/// How many reported-but-unclaimed units may queue per source.
const UNIT_QUEUE: usize = 32;

pub(crate) struct ManagerConfig {
    pub max_concurrent_sources: usize,
    pub max_concurrent_units: usize,
    pub chunk_buffer: usize,
    pub limits: HandlerLimits,
    pub unit_metrics: Option<mpsc::Sender<UnitMetrics>>,
}

struct ManagerInner {
    chunk_tx: Mutex<Option<mpsc::Sender<Chunk>>>,
    source_permits: Arc<Semaphore>,
    unit_permits: Arc<Semaphore>,
    limits: HandlerLimits,
    metrics_tx: Option<mpsc::Sender<UnitMetrics>>,
    cancel: CancellationToken,
    supervisors: Mutex<JoinSet<()>>,
    enrolled: Mutex<Vec<JobProgressRef>>,
    next_job: AtomicU32,
    next_source_id: AtomicU64,
}

/// Shared handle to the scan's source scheduler.
#[derive(Clone)]
pub(crate) struct SourceManager {
    inner: Arc<ManagerInner>,
}

impl SourceManager {
    /// Builds a manager and returns the receiving end of the shared chunk
    /// channel for the detector pool.
    pub fn new(cfg: ManagerConfig, cancel: CancellationToken) -> (Self, mpsc::Receiver<Chunk>) {
        let (chunk_tx, chunk_rx) = mpsc::channel(cfg.chunk_buffer);
        let manager = Self {
            inner: Arc::new(ManagerInner {
                chunk_tx: Mutex::new(Some(chunk_tx)),
                source_permits: Arc::new(Semaphore::new(cfg.max_concurrent_sources)),
                unit_permits: Arc::new(Semaphore::new(cfg.max_concurrent_units)),
                limits: cfg.limits,
                metrics_tx: cfg.unit_metrics,
                cancel,
                supervisors: Mutex::new(JoinSet::new()),
                enrolled: Mutex::new(Vec::new()),
                next_job: AtomicU32::new(1),
                next_source_id: AtomicU64::new(1),
            }),
        };
        (manager, chunk_rx)
    }

    /// Enrols a source: assigns a job id, spawns its supervisor, and
    /// returns the progress handle. Returns `None` once intake has closed.
    pub fn enroll(&self, source: Arc<dyn Source>, verify: bool) -> Option<JobProgressRef> {
        #[expect(clippy::unwrap_used, reason = "manager locks are never poisoned by design")]
        let chunk_tx = self.inner.chunk_tx.lock().unwrap().clone()?;

        let job_id = JobId(self.inner.next_job.fetch_add(1, Ordering::Relaxed));
        let source_id = self.inner.next_source_id.fetch_add(1, Ordering::Relaxed);
        let name: Arc<str> = Arc::from(source.name());
        let progress = JobProgressRef::new(job_id, source.kind(), Arc::clone(&name));

        #[expect(clippy::unwrap_used, reason = "manager locks are never poisoned by design")]
        self.inner.enrolled.lock().unwrap().push(progress.clone());

        let descriptor = SourceDescriptor {
            kind: source.kind(),
            name,
            id: source_id,
        };

        let inner = Arc::clone(&self.inner);
        let supervisor_progress = progress.clone();
        #[expect(clippy::unwrap_used, reason = "manager locks are never poisoned by design")]
        self.inner
            .supervisors
            .lock()
            .unwrap()
            .spawn(supervise(inner, source, descriptor, supervisor_progress, chunk_tx, verify));

        debug!(job = %job_id, "source enrolled");
        Some(progress)
    }

    /// Waits for every enrolled supervisor to finish. Enrolment is closed
    /// by the engine before this is called, so draining is loop-free in
    /// practice; the loop only guards against a racing late enrolment.
    pub async fn wait_for_sources(&self) {
        loop {
            #[expect(clippy::unwrap_used, reason = "manager locks are never poisoned by design")]
            let mut batch = std::mem::take(&mut *self.inner.supervisors.lock().unwrap());
            if batch.is_empty() {
                return;
            }
            while batch.join_next().await.is_some() {}
        }
    }

    /// Closes the chunk channel's intake; once all in-flight workers drop
    /// their senders the detector pool drains and exits.
    pub fn close_intake(&self) {
        #[expect(clippy::unwrap_used, reason = "manager locks are never poisoned by design")]
        self.inner.chunk_tx.lock().unwrap().take();
    }

    /// Attaches an error to a unit of an enrolled job. Used by the
    /// detector pool to record failures that surface after a chunk left
    /// its source.
    pub fn add_unit_error(&self, job_id: JobId, unit: &UnitId, error: &str) {
        #[expect(clippy::unwrap_used, reason = "manager locks are never poisoned by design")]
        let enrolled = self.inner.enrolled.lock().unwrap();
        if let Some(progress) = enrolled.iter().find(|p| p.job_id() == job_id) {
            progress.add_unit_error(unit, error);
        }
    }

    /// Returns progress handles for every enrolled source.
    pub fn progresses(&self) -> Vec<JobProgressRef> {
        #[expect(clippy::unwrap_used, reason = "manager locks are never poisoned by design")]
        self.inner.enrolled.lock().unwrap().clone()
    }
}

async fn supervise(
    inner: Arc<ManagerInner>,
    source: Arc<dyn Source>,
    descriptor: SourceDescriptor,
    progress: JobProgressRef,
    chunk_tx: mpsc::Sender<Chunk>,
    verify: bool,
) {
    let _source_permit = tokio::select! {
        _ = inner.cancel.cancelled() => {
            progress.fail_source("scan cancelled");
            return;
        }
        permit = Arc::clone(&inner.source_permits).acquire_owned() => {
            // The semaphore lives in the manager and is never closed.
            let Ok(permit) = permit else { return };
            permit
        }
    };

    let (unit_tx, mut unit_rx) = mpsc::channel::<SourceUnit>(UNIT_QUEUE);
    let reporter = UnitReporter::new(unit_tx, progress.clone(), inner.cancel.clone());

    let enum_source = Arc::clone(&source);
    let enum_cancel = inner.cancel.clone();
    let enumeration = tokio::spawn(async move { enum_source.enumerate(&enum_cancel, &reporter).await });

    let mut units: JoinSet<()> = JoinSet::new();
    let mut unit_names: HashMap<tokio::task::Id, UnitId> = HashMap::new();

    while let Some(unit) = unit_rx.recv().await {
        let permit = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            permit = Arc::clone(&inner.unit_permits).acquire_owned() => {
                let Ok(permit) = permit else { break };
                permit
            }
        };

        let unit_id = unit.id.clone();
        let handle = units.spawn(scan_unit(
            Arc::clone(&inner),
            Arc::clone(&source),
            descriptor.clone(),
            unit,
            progress.clone(),
            chunk_tx.clone(),
            verify,
            permit,
        ));
        unit_names.insert(handle.id(), unit_id);
    }

    match enumeration.await {
        Ok(Ok(())) => {}
        Ok(Err(SourceError::Cancelled)) => progress.fail_source("scan cancelled"),
        Ok(Err(e)) => progress.fail_source(e.to_string()),
        Err(join_error) if join_error.is_panic() => {
            progress.fail_source(format!("enumeration panicked: {}", panic_message(join_error)));
        }
        Err(_) => {}
    }

    while let Some(result) = units.join_next().await {
        if let Err(join_error) = result
            && join_error.is_panic()
        {
            let unit = unit_names
                .get(&join_error.id())
                .cloned()
                .unwrap_or_else(|| UnitId::new("unknown"));
            progress.add_unit_error(&unit, format!("unit worker panicked: {}", panic_message(join_error)));
            progress.unit_finished();
        }
    }

    progress.enumeration_finished();
}

#[expect(clippy::too_many_arguments, reason = "one worker per unit needs full pipeline context")]
async fn scan_unit(
    inner: Arc<ManagerInner>,
    source: Arc<dyn Source>,
    descriptor: SourceDescriptor,
    unit: SourceUnit,
    progress: JobProgressRef,
    chunk_tx: mpsc::Sender<Chunk>,
    verify: bool,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    progress.unit_started();
    let started_at = Utc::now();

    let emitter = ChunkEmitter::new(
        chunk_tx,
        descriptor,
        progress.job_id(),
        unit.id.clone(),
        verify,
        inner.cancel.clone(),
        inner.limits.clone(),
        progress.clone(),
    );

    match source.chunks(&inner.cancel, &unit, &emitter).await {
        Ok(()) | Err(SourceError::Cancelled) => {}
        Err(e) => progress.add_unit_error(&unit.id, e.to_string()),
    }

    let (chunks, bytes) = emitter.counters();
    progress.unit_finished();

    if let Some(metrics_tx) = &inner.metrics_tx {
        let errors = progress
            .snapshot()
            .errors
            .into_iter()
            .filter(|e| e.unit == unit.id.as_str())
            .map(|e| e.error)
            .collect();
        let record = UnitMetrics {
            source_name: progress.snapshot().source_name,
            unit: unit.id.to_string(),
            started_at,
            finished_at: Utc::now(),
            bytes,
            chunks,
            errors,
        };
        let _ = metrics_tx.send(record).await;
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    let payload = join_error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Provenance, SourceKind};
    use crate::source::BoxFuture;

    struct TwoUnitSource;

    impl Source for TwoUnitSource {
        fn kind(&self) -> SourceKind {
            SourceKind::Memory
        }

        fn name(&self) -> &str {
            "two-units"
        }

        fn enumerate<'a>(
            &'a self,
            _cancel: &'a CancellationToken,
            reporter: &'a UnitReporter,
        ) -> BoxFuture<'a, Result<(), SourceError>> {
            Box::pin(async move {
                reporter.report(SourceUnit::new("u1")).await?;
                reporter.report(SourceUnit::new("u2")).await?;
                Ok(())
            })
        }

        fn chunks<'a>(
            &'a self,
            _cancel: &'a CancellationToken,
            unit: &'a SourceUnit,
            emitter: &'a ChunkEmitter,
        ) -> BoxFuture<'a, Result<(), SourceError>> {
            Box::pin(async move {
                let provenance = Provenance::Memory {
                    name: unit.id.to_string(),
                    line: 1,
                };
                emitter.emit_raw(provenance, b"payload").await
            })
        }
    }

    struct FailingEnumeration;

    impl Source for FailingEnumeration {
        fn kind(&self) -> SourceKind {
            SourceKind::Memory
        }

        fn name(&self) -> &str {
            "broken"
        }

        fn enumerate<'a>(
            &'a self,
            _cancel: &'a CancellationToken,
            _reporter: &'a UnitReporter,
        ) -> BoxFuture<'a, Result<(), SourceError>> {
            Box::pin(async { Err(SourceError::Config("missing credentials".to_string())) })
        }

        fn chunks<'a>(
            &'a self,
            _cancel: &'a CancellationToken,
            _unit: &'a SourceUnit,
            _emitter: &'a ChunkEmitter,
        ) -> BoxFuture<'a, Result<(), SourceError>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct PanickingUnit;

    impl Source for PanickingUnit {
        fn kind(&self) -> SourceKind {
            SourceKind::Memory
        }

        fn name(&self) -> &str {
            "panicky"
        }

        fn enumerate<'a>(
            &'a self,
            _cancel: &'a CancellationToken,
            reporter: &'a UnitReporter,
        ) -> BoxFuture<'a, Result<(), SourceError>> {
            Box::pin(async move { reporter.report(SourceUnit::new("boom")).await })
        }

        fn chunks<'a>(
            &'a self,
            _cancel: &'a CancellationToken,
            _unit: &'a SourceUnit,
            _emitter: &'a ChunkEmitter,
        ) -> BoxFuture<'a, Result<(), SourceError>> {
            Box::pin(async { panic!("detector ate the chunk") })
        }
    }

    fn make_manager(buffer: usize) -> (SourceManager, mpsc::Receiver<Chunk>) {
        SourceManager::new(
            ManagerConfig {
                max_concurrent_sources: 2,
                max_concurrent_units: 4,
                chunk_buffer: buffer,
                limits: HandlerLimits::default(),
                unit_metrics: None,
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn units_produce_chunks_and_progress_completes() {
        let (manager, mut rx) = make_manager(16);
        let progress = manager.enroll(Arc::new(TwoUnitSource), false).unwrap();

        manager.wait_for_sources().await;
        progress.done().await;

        let snap = progress.snapshot();
        assert_eq!(snap.units_enumerated, 2);
        assert_eq!(snap.units_finished, 2);
        assert_eq!(snap.chunks, 2);
        assert!(snap.source_failure.is_none());

        manager.close_intake();
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn fatal_enumeration_error_fails_only_that_source() {
        let (manager, _rx) = make_manager(16);
        let bad = manager.enroll(Arc::new(FailingEnumeration), false).unwrap();
        let good = manager.enroll(Arc::new(TwoUnitSource), false).unwrap();

        manager.wait_for_sources().await;

        assert!(bad.snapshot().source_failure.is_some());
        assert!(good.snapshot().source_failure.is_none());
        assert_eq!(good.snapshot().units_finished, 2);
    }

    #[tokio::test]
    async fn unit_panic_is_recorded_and_scan_continues() {
        let (manager, _rx) = make_manager(16);
        let progress = manager.enroll(Arc::new(PanickingUnit), false).unwrap();

        manager.wait_for_sources().await;
        progress.done().await;

        let snap = progress.snapshot();
        assert_eq!(snap.units_finished, 1);
        assert_eq!(snap.errors.len(), 1);
        assert!(snap.errors[0].error.contains("panicked"));
        assert_eq!(snap.errors[0].unit, "boom");
    }

    #[tokio::test]
    async fn enroll_after_close_intake_is_rejected() {
        let (manager, _rx) = make_manager(16);
        manager.close_intake();
        assert!(manager.enroll(Arc::new(TwoUnitSource), false).is_none());
    }
}
