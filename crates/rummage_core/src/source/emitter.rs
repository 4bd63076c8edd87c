//! Turns source artifacts into chunks on the pipeline.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::chunk::{Chunk, Chunker, JobId, Provenance, SourceDescriptor, UnitId};
use crate::error::{HandlerError, SourceError};
use crate::handler::{self, HandlerLimits};
use crate::source::progress::JobProgressRef;

/// Per-unit handle through which an adapter emits artifacts.
///
/// The emitter owns the full artifact-to-chunk path: handler expansion
/// (archives, binaries), windowing with overlap, and the backpressured
/// send onto the shared chunk channel. Sends block when detector workers
/// fall behind; that blocking is the engine's only producer throttle.
pub struct ChunkEmitter {
    tx: mpsc::Sender<Chunk>,
    source: SourceDescriptor,
    job_id: JobId,
    unit: UnitId,
    verify: bool,
    cancel: CancellationToken,
    limits: HandlerLimits,
    progress: JobProgressRef,
    chunks: AtomicU64,
    bytes: AtomicU64,
}

impl ChunkEmitter {
    #[expect(clippy::too_many_arguments, reason = "constructed in one place by the source manager")]
    pub(crate) fn new(
        tx: mpsc::Sender<Chunk>,
        source: SourceDescriptor,
        job_id: JobId,
        unit: UnitId,
        verify: bool,
        cancel: CancellationToken,
        limits: HandlerLimits,
        progress: JobProgressRef,
    ) -> Self {
        Self {
            tx,
            source,
            job_id,
            unit,
            verify,
            cancel,
            limits,
            progress,
            chunks: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Emits one artifact: expands archives, drops skipped binaries, and
    /// windows every resulting leaf into chunks.
    ///
    /// Handler warnings (depth exceeded, oversized entries, unsupported
    /// formats, extraction timeouts) are recorded on the unit's progress;
    /// only cancellation and channel teardown surface as errors.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Cancelled`] when the scan is being torn down.
    pub async fn emit_artifact(&self, provenance: Provenance, data: Vec<u8>) -> Result<(), SourceError> {
        let name = provenance.path().to_string();
        let limits = self.limits.clone();

        let expanded = tokio::time::timeout(
            self.limits.timeout,
            tokio::task::spawn_blocking(move || handler::expand(&name, data, &limits)),
        )
        .await;

        let expansion = match expanded {
            Ok(Ok(expansion)) => expansion,
            Ok(Err(join_error)) => {
                self.record_warning(&format!("artifact expansion panicked: {join_error}"));
                return Ok(());
            }
            Err(_elapsed) => {
                // Partial output from the blocking task is discarded.
                self.record_warning(&HandlerError::Timeout(self.limits.timeout).to_string());
                return Ok(());
            }
        };

        for warning in &expansion.warnings {
            self.record_warning(&warning.to_string());
        }

        for leaf in expansion.leaves {
            let leaf_provenance = match &leaf.member {
                Some(member) => provenance.with_member(member),
                None => provenance.clone(),
            };
            self.emit_windows(leaf_provenance, &leaf.data, leaf.decoder).await?;
        }

        Ok(())
    }

    /// Windows `data` and sends each window as a chunk, skipping the
    /// handler layer. Used by adapters whose payloads are never archives
    /// (already-decoded wire data, for example).
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Cancelled`] when the scan is being torn down.
    pub async fn emit_raw(&self, provenance: Provenance, data: &[u8]) -> Result<(), SourceError> {
        self.emit_windows(provenance, data, None).await
    }

    /// Records a non-fatal warning against this unit.
    pub fn record_warning(&self, message: &str) {
        warn!(unit = %self.unit, message, "unit warning");
        self.progress.add_unit_error(&self.unit, message);
    }

    async fn emit_windows(
        &self,
        provenance: Provenance,
        data: &[u8],
        decoder: Option<&'static str>,
    ) -> Result<(), SourceError> {
        for window in Chunker::new(Cursor::new(data)) {
            // Reads from an in-memory cursor cannot fail.
            let Ok(window) = window else { continue };
            let chunk = Chunk {
                provenance: provenance.with_line(window.line),
                data: window.bytes,
                source: self.source.clone(),
                job_id: self.job_id,
                unit: self.unit.clone(),
                verify: self.verify,
                decoder,
            };
            self.send(chunk).await?;
        }
        Ok(())
    }

    async fn send(&self, chunk: Chunk) -> Result<(), SourceError> {
        let size = chunk.data.len() as u64;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SourceError::Cancelled),
            sent = self.tx.send(chunk) => {
                sent.map_err(|_| SourceError::Cancelled)?;
                self.chunks.fetch_add(1, Ordering::Relaxed);
                self.bytes.fetch_add(size, Ordering::Relaxed);
                self.progress.add_chunk(size);
                Ok(())
            }
        }
    }

    /// Returns (chunks, bytes) emitted through this handle so far.
    pub(crate) fn counters(&self) -> (u64, u64) {
        (self.chunks.load(Ordering::Relaxed), self.bytes.load(Ordering::Relaxed))
    }
}
