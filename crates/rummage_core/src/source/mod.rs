//! The source adapter contract and the machinery shared by all adapters.
//!
//! A [`Source`] enumerates [`SourceUnit`]s and then emits chunks for each
//! unit through a [`ChunkEmitter`]. Adapters must respect cancellation,
//! must not share mutable state across units, and must populate
//! provenance deterministically so findings are locatable.

mod emitter;
pub mod filesystem;
pub mod git;
mod manager;
mod path_filter;
mod progress;

pub use emitter::ChunkEmitter;
pub use filesystem::{FilesystemConfig, FilesystemSource};
pub use git::{GitConfig, GitSource};
pub(crate) use manager::{ManagerConfig, SourceManager};
pub use path_filter::PathFilter;
pub use progress::{JobProgressRef, JobProgressSnapshot, UnitError, UnitMetrics};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chunk::{SourceKind, UnitId};
use crate::error::SourceError;

pub use rummage_detectors::BoxFuture;

/// One logical enumeration target within a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Stable identifier used in progress records and provenance.
    pub id: UnitId,
}

impl SourceUnit {
    /// Creates a unit from its display id.
    #[must_use]
    pub fn new(id: impl Into<std::sync::Arc<str>>) -> Self {
        Self { id: UnitId::new(id) }
    }
}

/// Callback handle through which [`Source::enumerate`] reports units.
pub struct UnitReporter {
    tx: mpsc::Sender<SourceUnit>,
    progress: JobProgressRef,
    cancel: CancellationToken,
}

impl UnitReporter {
    pub(crate) fn new(tx: mpsc::Sender<SourceUnit>, progress: JobProgressRef, cancel: CancellationToken) -> Self {
        Self { tx, progress, cancel }
    }

    /// Reports one discovered unit.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Cancelled`] when the scan is being torn down.
    pub async fn report(&self, unit: SourceUnit) -> Result<(), SourceError> {
        self.progress.unit_enumerated();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SourceError::Cancelled),
            sent = self.tx.send(unit) => sent.map_err(|_| SourceError::Cancelled),
        }
    }
}

/// A data source the engine can scan.
///
/// Implementations may block on I/O inside either method; both must
/// return promptly once the cancellation token fires. The engine calls
/// `enumerate` exactly once per enrolment and `chunks` once per reported
/// unit, possibly concurrently across units.
pub trait Source: Send + Sync + 'static {
    /// Returns the adapter kind for provenance records.
    fn kind(&self) -> SourceKind;

    /// Returns the operator-facing name of this source instance.
    fn name(&self) -> &str;

    /// Discovers units and reports each through `reporter`.
    ///
    /// A returned error is treated as a fatal configuration problem and
    /// fails the whole source; per-unit trouble belongs in `chunks`.
    fn enumerate<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        reporter: &'a UnitReporter,
    ) -> BoxFuture<'a, Result<(), SourceError>>;

    /// Emits zero or more chunks for one unit, then returns.
    ///
    /// Errors are recorded on the unit's progress; they never abort the
    /// scan.
    fn chunks<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        unit: &'a SourceUnit,
        emitter: &'a ChunkEmitter,
    ) -> BoxFuture<'a, Result<(), SourceError>>;
}
