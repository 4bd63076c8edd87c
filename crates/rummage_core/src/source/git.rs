//! Git source adapter.
//!
//! Walks revision history newest-to-oldest, diffing each commit against
//! its first parent and emitting every added or modified blob. With a
//! base commit configured the collected commits are replayed oldest-first
//! instead, so findings appear in causal order; callers pin detector
//! concurrency to 1 in that mode to preserve it end to end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use gix::bstr::ByteSlice as _;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::{Provenance, SourceKind, UnitId};
use crate::error::SourceError;
use crate::source::path_filter::PathFilter;
use crate::source::{BoxFuture, ChunkEmitter, Source, SourceUnit, UnitReporter};

/// Configuration for a git history scan.
#[derive(Debug, Default, Clone)]
pub struct GitConfig {
    /// Repository location: a local path, `file://` URI, or a remote
    /// `https://`/`ssh://` URI (remotes are mirror-cloned to a temp dir).
    pub uri: String,
    /// Branch or ref to start the walk from; defaults to every local
    /// branch (or HEAD when `skip_additional_refs` is set).
    pub head_ref: Option<String>,
    /// Base commit: only commits after this one are scanned, replayed
    /// oldest-first.
    pub base_ref: Option<String>,
    /// Maximum number of commits to walk.
    pub max_depth: Option<usize>,
    /// Open the repository as bare (pre-receive hooks, mirror clones).
    /// Working-tree-only files are never seen in this mode.
    pub bare: bool,
    /// File of newline-separated regexes; only matching paths are scanned.
    pub include_paths_file: Option<PathBuf>,
    /// File of newline-separated regexes; matching paths are skipped.
    pub exclude_paths_file: Option<PathBuf>,
    /// Comma-separated globs excluded at the tree-diff level.
    pub exclude_globs: Option<String>,
    /// Walk HEAD only instead of every local branch.
    pub skip_additional_refs: bool,
}

/// Scans git revision history.
#[derive(Debug)]
pub struct GitSource {
    cfg: GitConfig,
    filter: PathFilter,
    exclude_globs: Option<globset::GlobSet>,
    name: String,
    /// Local checkout path, resolved (and possibly cloned) at enumeration.
    local_path: OnceCell<PathBuf>,
    /// Keeps a mirror clone alive for the lifetime of the scan.
    clone_dir: std::sync::Mutex<Option<tempfile::TempDir>>,
}

impl GitSource {
    /// Validates the configuration and builds the adapter.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] for an empty URI, unreadable path
    /// filter files, or malformed exclude globs.
    pub fn new(cfg: GitConfig) -> Result<Self, SourceError> {
        if cfg.uri.is_empty() {
            return Err(SourceError::Config("git source needs a repository URI".to_string()));
        }

        let filter = PathFilter::from_files(cfg.include_paths_file.as_deref(), cfg.exclude_paths_file.as_deref())?;
        let exclude_globs = build_globset(cfg.exclude_globs.as_deref())?;

        Ok(Self {
            name: format!("git:{}", cfg.uri),
            filter,
            exclude_globs,
            local_path: OnceCell::new(),
            clone_dir: std::sync::Mutex::new(None),
            cfg,
        })
    }

    /// Resolves the repository to a local path, mirror-cloning remotes.
    async fn resolve_local(&self) -> Result<PathBuf, SourceError> {
        if let Some(path) = self.cfg.uri.strip_prefix("file://") {
            return Ok(PathBuf::from(path));
        }
        if !self.cfg.uri.contains("://") && !self.cfg.uri.starts_with("git@") {
            return Ok(PathBuf::from(&self.cfg.uri));
        }

        let temp = tempfile::tempdir().map_err(SourceError::Io)?;
        let target = temp.path().join("mirror");
        debug!(uri = %self.cfg.uri, "mirror-cloning remote repository");

        let status = tokio::process::Command::new("git")
            .arg("clone")
            .arg("--mirror")
            .arg("--quiet")
            .arg(&self.cfg.uri)
            .arg(&target)
            .status()
            .await
            .map_err(SourceError::Io)?;
        if !status.success() {
            return Err(SourceError::Config(format!(
                "failed to clone '{}' (git exited with {status})",
                self.cfg.uri
            )));
        }

        #[expect(clippy::unwrap_used, reason = "clone_dir lock is never poisoned by design")]
        self.clone_dir.lock().unwrap().replace(temp);
        Ok(target)
    }

    fn open_repo(&self, path: &Path) -> Result<gix::Repository, SourceError> {
        let repo = if self.cfg.bare {
            gix::open(path).map_err(|e| SourceError::Git(e.to_string()))?
        } else {
            gix::discover(path)
                .or_else(|_| gix::open(path))
                .map_err(|e| SourceError::Git(e.to_string()))?
        };
        Ok(repo)
    }

    fn walk_tips(&self, repo: &gix::Repository) -> Result<Vec<gix::ObjectId>, SourceError> {
        if let Some(head_ref) = &self.cfg.head_ref {
            let oid = repo
                .rev_parse_single(head_ref.as_str())
                .map(gix::Id::detach)
                .map_err(|_err| SourceError::Config(format!("cannot resolve ref '{head_ref}'")))?;
            return Ok(vec![oid]);
        }

        if !self.cfg.skip_additional_refs {
            let mut tips = Vec::new();
            if let Ok(refs) = repo.references()
                && let Ok(locals) = refs.local_branches()
            {
                tips.extend(locals.flatten().map(|b| b.id().detach()));
            }
            if !tips.is_empty() {
                return Ok(tips);
            }
        }

        repo.head_id()
            .map(|id| vec![id.detach()])
            .map_err(|e| SourceError::Git(format!("no HEAD to walk: {e}")))
    }

    /// Collects commit ids newest-first, stopping at `base_ref` and
    /// honouring `max_depth`.
    fn collect_commits(&self, repo: &gix::Repository) -> Result<Vec<gix::ObjectId>, SourceError> {
        let tips = self.walk_tips(repo)?;

        let stop_at = match &self.cfg.base_ref {
            Some(base) => Some(
                repo.rev_parse_single(base.as_str())
                    .map(gix::Id::detach)
                    .map_err(|_err| SourceError::Config(format!("cannot resolve base ref '{base}'")))?,
            ),
            None => None,
        };

        #[expect(
            clippy::default_trait_access,
            reason = "CommitTimeOrder is a private type in gix; cannot name it explicitly"
        )]
        let walk = repo
            .rev_walk(tips)
            .sorting(gix::revision::walk::Sorting::ByCommitTime(Default::default()));

        let limit = self.cfg.max_depth.unwrap_or(usize::MAX);
        let mut commits = Vec::with_capacity(limit.min(1024));

        for info in walk.all().map_err(|e| SourceError::Git(e.to_string()))?.flatten() {
            if stop_at.is_some_and(|id| info.id == id) {
                break;
            }
            commits.push(info.id);
            if commits.len() >= limit {
                break;
            }
        }

        // Base-commit scans replay history forward from the base.
        if stop_at.is_some() {
            commits.reverse();
        }

        Ok(commits)
    }

    async fn scan_repo(&self, cancel: &CancellationToken, emitter: &ChunkEmitter) -> Result<(), SourceError> {
        let path = self
            .local_path
            .get()
            .cloned()
            .ok_or_else(|| SourceError::Git("repository was not resolved during enumeration".to_string()))?;
        let repo = self.open_repo(&path)?;
        let commits = self.collect_commits(&repo)?;
        debug!(commits = commits.len(), "walking revision history");

        for commit_id in commits {
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            let artifacts = self.collect_commit_artifacts(&repo, commit_id, emitter);
            for (provenance, data) in artifacts {
                emitter.emit_artifact(provenance, data).await?;
            }
        }
        Ok(())
    }

    /// Gathers the artifacts a single commit contributes, without holding
    /// the (non-`Send`) repository handle across an await point.
    fn collect_commit_artifacts(
        &self,
        repo: &gix::Repository,
        commit_id: gix::ObjectId,
        emitter: &ChunkEmitter,
    ) -> Vec<(Provenance, Vec<u8>)> {
        let Ok(commit) = repo.find_commit(commit_id) else {
            emitter.record_warning(&format!("cannot load commit {commit_id}"));
            return Vec::new();
        };

        let (email, timestamp) = commit_signature(&commit);
        let changes = commit_changes(repo, &commit);

        let mut artifacts = Vec::new();
        for changed in changes {
            if !self.filter.is_match(&changed.path) {
                continue;
            }
            if let Some(globs) = &self.exclude_globs
                && globs.is_match(changed.path.as_str())
            {
                continue;
            }

            let Ok(blob) = repo.find_blob(changed.blob_id) else {
                emitter.record_warning(&format!("cannot load blob for '{}'", changed.path));
                continue;
            };

            let provenance = Provenance::Git {
                repository: self.cfg.uri.clone(),
                commit: commit_id.to_string(),
                path: changed.path.clone(),
                email: email.clone(),
                timestamp: timestamp.clone(),
                line: 1,
            };
            artifacts.push((provenance, blob.data.clone()));
        }

        artifacts
    }
}

struct ChangedFile {
    path: String,
    blob_id: gix::ObjectId,
}

/// Returns the files added, modified, or rewritten by `commit`, diffing
/// against its first parent tree (the empty tree for root commits).
fn commit_changes(repo: &gix::Repository, commit: &gix::Commit<'_>) -> Vec<ChangedFile> {
    let Ok(tree) = commit.tree() else {
        return Vec::new();
    };

    let parent_tree = commit
        .parent_ids()
        .next()
        .and_then(|pid| repo.find_commit(pid).ok())
        .and_then(|pc| pc.tree().ok());
    let from_tree = parent_tree.as_ref().map_or_else(|| repo.empty_tree(), Clone::clone);

    let Ok(mut changes) = from_tree.changes() else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    let _ = changes.for_each_to_obtain_tree(&tree, |change| {
        use gix::object::tree::diff::Change;

        match change {
            Change::Addition { location, id, .. }
            | Change::Modification { location, id, .. }
            | Change::Rewrite { location, id, .. } => {
                entries.push(ChangedFile {
                    path: location.to_str_lossy().into_owned(),
                    blob_id: id.detach(),
                });
            }
            Change::Deletion { .. } => {}
        }

        Ok::<_, std::convert::Infallible>(gix::object::tree::diff::Action::Continue)
    });

    entries
}

fn commit_signature(commit: &gix::Commit<'_>) -> (String, String) {
    let email = commit
        .author()
        .map(|author| author.email.to_str_lossy().into_owned())
        .unwrap_or_default();
    let timestamp = commit
        .time()
        .ok()
        .and_then(|time| chrono::DateTime::from_timestamp(time.seconds, 0))
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();
    (email, timestamp)
}

fn build_globset(globs: Option<&str>) -> Result<Option<globset::GlobSet>, SourceError> {
    let Some(globs) = globs else {
        return Ok(None);
    };

    let mut builder = globset::GlobSetBuilder::new();
    for glob in globs.split(',').map(str::trim).filter(|g| !g.is_empty()) {
        let compiled =
            globset::Glob::new(glob).map_err(|e| SourceError::Config(format!("invalid exclude glob '{glob}': {e}")))?;
        builder.add(compiled);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| SourceError::Config(format!("cannot build exclude glob set: {e}")))
}

impl Source for GitSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Git
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
            let path = self
                .local_path
                .get_or_try_init(|| self.resolve_local())
                .await?
                .clone();

            // Fail enumeration, not the unit, when the repo cannot open.
            self.open_repo(&path)?;

            reporter
                .report(SourceUnit {
                    id: UnitId::new(Arc::from(self.cfg.uri.as_str())),
                })
                .await
        })
    }

    fn chunks<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        _unit: &'a SourceUnit,
        emitter: &'a ChunkEmitter,
    ) -> BoxFuture<'a, Result<(), SourceError>> {
        Box::pin(async move {
            let result = self.scan_repo(cancel, emitter).await;
            if let Err(SourceError::Cancelled) = &result {
                warn!("git scan cancelled mid-walk");
            }
            result
        })
    }
}
