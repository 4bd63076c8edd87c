//! In-process test doubles for embedders and the engine's own tests.
//!
//! Nothing here touches the network or the filesystem: the in-memory
//! source feeds fixed blobs through the real pipeline, the stub detector
//! matches a configurable pattern, and the stub verifier returns a fixed
//! outcome, which makes verified/unverified labels bit-reproducible.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use rummage_detectors::{
    BoxFuture, Candidate, Detector, DetectorId, Verification, VerificationError, Verifier, VerifierOutcome,
    candidates_from_regex,
};

use crate::chunk::{Provenance, SourceKind};
use crate::dispatch::Dispatcher;
use crate::error::SourceError;
use crate::finding::Finding;
use crate::source::{ChunkEmitter, Source, SourceUnit, UnitReporter};

/// A source that serves fixed in-memory blobs, one unit per entry.
pub struct InMemorySource {
    name: String,
    units: Vec<(String, Vec<(String, Vec<u8>)>)>,
}

impl InMemorySource {
    /// Creates a source named `name` with `(unit, [(blob name, bytes)])`
    /// entries.
    #[must_use]
    pub fn new(name: &str, units: Vec<(String, Vec<(String, Vec<u8>)>)>) -> Self {
        Self {
            name: name.to_string(),
            units,
        }
    }

    /// Convenience constructor: one unit holding one blob.
    #[must_use]
    pub fn single(name: &str, blob_name: &str, data: &[u8]) -> Self {
        Self::new(
            name,
            vec![("unit-0".to_string(), vec![(blob_name.to_string(), data.to_vec())])],
        )
    }
}

impl Source for InMemorySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Memory
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
            for (unit, _) in &self.units {
                reporter.report(SourceUnit::new(unit.as_str())).await?;
            }
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
            let Some((_, blobs)) = self.units.iter().find(|(id, _)| id == unit.id.as_str()) else {
                return Ok(());
            };
            for (blob_name, data) in blobs {
                let provenance = Provenance::Memory {
                    name: blob_name.clone(),
                    line: 1,
                };
                emitter.emit_artifact(provenance, data.clone()).await?;
            }
            Ok(())
        })
    }
}

/// A detector with a configurable id, keywords, and pattern.
pub struct StubDetector {
    id: DetectorId,
    name: &'static str,
    keywords: &'static [&'static str],
    pattern: regex::bytes::Regex,
    verifier: Option<StubVerifier>,
}

impl StubDetector {
    /// Builds a stub detector from a pattern with the credential in
    /// capture group 1 (or the whole match).
    ///
    /// # Panics
    ///
    /// Panics when the pattern does not compile; stubs are test inputs.
    #[must_use]
    pub fn new(id: u32, name: &'static str, keywords: &'static [&'static str], pattern: &str) -> Self {
        #[expect(clippy::unwrap_used, reason = "test patterns are fixed at the call site")]
        let pattern = regex::bytes::Regex::new(pattern).unwrap();
        Self {
            id: DetectorId(id),
            name,
            keywords,
            pattern,
            verifier: None,
        }
    }

    /// Attaches a verifier that always answers with `outcome`.
    #[must_use]
    pub fn with_verifier(mut self, outcome: Verification) -> Self {
        self.verifier = Some(StubVerifier { outcome });
        self
    }
}

impl Detector for StubDetector {
    fn id(&self) -> DetectorId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn keywords(&self) -> &'static [&'static str] {
        self.keywords
    }

    fn from_data(&self, data: &[u8]) -> Vec<Candidate> {
        candidates_from_regex(&self.pattern, data)
    }

    fn verifier(&self) -> Option<&dyn Verifier> {
        self.verifier.as_ref().map(|v| v as &dyn Verifier)
    }
}

/// A verifier that answers without touching the network.
pub struct StubVerifier {
    outcome: Verification,
}

impl Verifier for StubVerifier {
    fn default_endpoint(&self) -> &'static str {
        "stub://local"
    }

    fn verify<'a>(
        &'a self,
        _client: &'a reqwest::Client,
        _secret: &'a str,
        _endpoint: &'a str,
    ) -> BoxFuture<'a, Result<VerifierOutcome, VerificationError>> {
        let outcome = self.outcome;
        Box::pin(async move {
            Ok(VerifierOutcome {
                verification: outcome,
                extra: Vec::new(),
            })
        })
    }
}

/// A dispatcher that stores findings for later assertions.
#[derive(Default)]
pub struct CollectingSink {
    findings: Mutex<Vec<Finding>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared handle suitable for `EngineConfig::dispatcher`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Returns a copy of everything dispatched so far.
    ///
    /// # Panics
    ///
    /// Panics if a dispatching worker panicked while holding the lock.
    #[must_use]
    pub fn findings(&self) -> Vec<Finding> {
        #[expect(clippy::unwrap_used, reason = "sink lock is never poisoned by design")]
        self.findings.lock().unwrap().clone()
    }

    /// Returns the number of findings dispatched so far.
    #[must_use]
    pub fn len(&self) -> usize {
        #[expect(clippy::unwrap_used, reason = "sink lock is never poisoned by design")]
        self.findings.lock().unwrap().len()
    }

    /// Returns `true` when nothing has been dispatched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Dispatcher for CollectingSink {
    fn dispatch(&self, finding: &Finding) {
        #[expect(clippy::unwrap_used, reason = "sink lock is never poisoned by design")]
        self.findings.lock().unwrap().push(finding.clone());
    }
}
