//! Filesystem source adapter.
//!
//! Each configured path is one unit. Directories are walked with the
//! `ignore` walker (all standard filters off: hidden files and
//! gitignored files are scanned too), files are read whole and handed to
//! the emitter, which expands archives and windows the bytes.

use std::path::PathBuf;
use std::sync::Arc;

use ignore::WalkBuilder;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::chunk::{Provenance, SourceKind};
use crate::error::SourceError;
use crate::source::path_filter::PathFilter;
use crate::source::{BoxFuture, ChunkEmitter, Source, SourceUnit, UnitReporter};

/// Configuration for a filesystem scan.
#[derive(Debug, Default, Clone)]
pub struct FilesystemConfig {
    /// Files or directories to scan; each becomes one unit.
    pub paths: Vec<PathBuf>,
    /// File of newline-separated regexes; only matching paths are scanned.
    pub include_paths_file: Option<PathBuf>,
    /// File of newline-separated regexes; matching paths are skipped.
    pub exclude_paths_file: Option<PathBuf>,
}

/// Scans files and directories on the local filesystem.
#[derive(Debug)]
pub struct FilesystemSource {
    paths: Vec<PathBuf>,
    filter: PathFilter,
    name: String,
}

impl FilesystemSource {
    /// Validates the configuration and builds the adapter.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] when no paths are given or a path
    /// filter file is unreadable or malformed.
    pub fn new(cfg: FilesystemConfig) -> Result<Self, SourceError> {
        if cfg.paths.is_empty() {
            return Err(SourceError::Config("filesystem source needs at least one path".to_string()));
        }

        let filter = PathFilter::from_files(cfg.include_paths_file.as_deref(), cfg.exclude_paths_file.as_deref())?;

        Ok(Self {
            name: format!("filesystem:{}", cfg.paths[0].display()),
            paths: cfg.paths,
            filter,
        })
    }

    async fn scan_path(
        &self,
        cancel: &CancellationToken,
        root: &PathBuf,
        emitter: &ChunkEmitter,
    ) -> Result<(), SourceError> {
        if root.is_file() {
            return self.emit_file(root.clone(), emitter).await;
        }

        let walker = WalkBuilder::new(root).standard_filters(false).build();
        for entry in walker {
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    emitter.record_warning(&format!("walk error: {e}"));
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }

            let path = entry.into_path();
            if !self.filter.is_match(&path.to_string_lossy()) {
                trace!(path = %path.display(), "filtered out");
                continue;
            }

            self.emit_file(path, emitter).await?;
        }

        Ok(())
    }

    async fn emit_file(&self, path: PathBuf, emitter: &ChunkEmitter) -> Result<(), SourceError> {
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                emitter.record_warning(&format!("cannot read '{}': {e}", path.display()));
                return Ok(());
            }
        };

        let provenance = Provenance::Filesystem {
            path: path.display().to_string(),
            line: 1,
        };
        emitter.emit_artifact(provenance, data).await
    }
}

impl Source for FilesystemSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Filesystem
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn enumerate<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        reporter: &'a UnitReporter,
    ) -> BoxFuture<'a, Result<(), SourceError>> {
        Box::pin(async move {
            for path in &self.paths {
                reporter
                    .report(SourceUnit {
                        id: crate::chunk::UnitId::new(Arc::from(path.display().to_string())),
                    })
                    .await?;
            }
            Ok(())
        })
    }

    fn chunks<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        unit: &'a SourceUnit,
        emitter: &'a ChunkEmitter,
    ) -> BoxFuture<'a, Result<(), SourceError>> {
        Box::pin(async move {
            let root = PathBuf::from(unit.id.as_str());
            self.scan_path(cancel, &root, emitter).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, JobId, SourceDescriptor, UnitId};
    use crate::handler::HandlerLimits;
    use crate::source::progress::JobProgressRef;
    use tokio::sync::mpsc;

    fn make_emitter() -> (ChunkEmitter, mpsc::Receiver<Chunk>, JobProgressRef) {
        let (tx, rx) = mpsc::channel(64);
        let progress = JobProgressRef::new(JobId(1), SourceKind::Filesystem, Arc::from("fs"));
        let emitter = ChunkEmitter::new(
            tx,
            SourceDescriptor {
                kind: SourceKind::Filesystem,
                name: Arc::from("fs"),
                id: 1,
            },
            JobId(1),
            UnitId::new("unit"),
            false,
            CancellationToken::new(),
            HandlerLimits::default(),
            progress.clone(),
        );
        (emitter, rx, progress)
    }

    async fn drain(mut rx: mpsc::Receiver<Chunk>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn empty_config_is_rejected() {
        let err = FilesystemSource::new(FilesystemConfig::default()).unwrap_err();
        assert!(matches!(err, SourceError::Config(_)));
    }

    #[tokio::test]
    async fn scans_a_single_file_unit() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("creds.txt");
        std::fs::write(&file, "hello secret").unwrap();

        let source = FilesystemSource::new(FilesystemConfig {
            paths: vec![file.clone()],
            ..FilesystemConfig::default()
        })
        .unwrap();

        let (emitter, rx, _) = make_emitter();
        let unit = SourceUnit::new(Arc::from(file.display().to_string()));
        source
            .chunks(&CancellationToken::new(), &unit, &emitter)
            .await
            .unwrap();

        let chunks = drain(rx).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, b"hello secret");
        assert_eq!(chunks[0].provenance.path(), file.display().to_string());
    }

    #[tokio::test]
    async fn walks_directories_recursively_including_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        std::fs::write(dir.path().join("nested/b.txt"), "two").unwrap();
        std::fs::write(dir.path().join(".env"), "three").unwrap();

        let source = FilesystemSource::new(FilesystemConfig {
            paths: vec![dir.path().to_path_buf()],
            ..FilesystemConfig::default()
        })
        .unwrap();

        let (emitter, rx, _) = make_emitter();
        let unit = SourceUnit::new(Arc::from(dir.path().display().to_string()));
        source
            .chunks(&CancellationToken::new(), &unit, &emitter)
            .await
            .unwrap();

        let chunks = drain(rx).await;
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test]
    async fn exclude_filter_skips_matching_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "keep").unwrap();
        std::fs::write(dir.path().join("skip.log"), "skip").unwrap();
        let exclude_file = dir.path().join("excludes");
        std::fs::write(&exclude_file, "\\.log$\n").unwrap();

        let source = FilesystemSource::new(FilesystemConfig {
            paths: vec![dir.path().to_path_buf()],
            exclude_paths_file: Some(exclude_file.clone()),
            ..FilesystemConfig::default()
        })
        .unwrap();

        let (emitter, rx, _) = make_emitter();
        let unit = SourceUnit::new(Arc::from(dir.path().display().to_string()));
        source
            .chunks(&CancellationToken::new(), &unit, &emitter)
            .await
            .unwrap();

        let chunks = drain(rx).await;
        // The exclude file itself matches nothing; keep.txt and excludes both emit.
        assert!(chunks.iter().all(|c| !c.provenance.path().ends_with("skip.log")));
    }

    #[tokio::test]
    async fn enumerate_reports_one_unit_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();

        let source = FilesystemSource::new(FilesystemConfig {
            paths: vec![a, b],
            ..FilesystemConfig::default()
        })
        .unwrap();

        let (unit_tx, mut unit_rx) = mpsc::channel(8);
        let progress = JobProgressRef::new(JobId(1), SourceKind::Filesystem, Arc::from("fs"));
        let reporter = UnitReporter::new(unit_tx, progress, CancellationToken::new());
        source.enumerate(&CancellationToken::new(), &reporter).await.unwrap();
        drop(reporter);

        let mut units = Vec::new();
        while let Some(unit) = unit_rx.recv().await {
            units.push(unit);
        }
        assert_eq!(units.len(), 2);
    }
}
