//! Credential-discovery engine for rummage.
//!
//! The pipeline: sources enumerate units, units emit overlapping byte
//! windows ([`Chunk`]s) through the archive-aware handler layer, a pool
//! of detector workers pattern-matches every window, candidates are
//! optionally live-verified through a memoizing cache, and surviving
//! findings flow to a pluggable [`Dispatcher`].
//!
//! # Main Types
//!
//! - [`Engine`] - Wires the pipeline and owns the scan lifecycle
//! - [`EngineConfig`] - Construction-time snapshot of every toggle
//! - [`Source`] - Contract implemented by data-source adapters
//! - [`Finding`] - A located credential with provenance
//! - [`JobProgressRef`] - Append-only per-source progress and errors
//!
//! # Error Handling
//!
//! Library crates use [`thiserror`] enums ([`EngineError`],
//! [`SourceError`], [`HandlerError`]). The engine never writes to stderr
//! and never exits; scan-time errors surface through [`JobProgressRef`]
//! snapshots and the CLI decides what to do with them.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

/// Binary content detection.
pub mod binary;
/// Verification memoization.
pub mod cache;
/// Byte windows and provenance.
pub mod chunk;
/// Finding sinks.
pub mod dispatch;
mod engine;
/// Shannon entropy over raw bytes.
pub mod entropy;
/// Error types for the pipeline.
pub mod error;
mod executor;
/// Result filters applied before dispatch.
pub mod filters;
/// Findings and redaction.
pub mod finding;
/// Archive and binary decoding.
pub mod handler;
mod metrics;
/// Source adapters and scheduling.
pub mod source;
/// In-process test doubles.
pub mod testing;

pub use cache::{CacheKey, CacheMetrics, CachedVerification, VerificationCache};
pub use chunk::{
    CHUNK_OVERLAP, Chunk, ChunkWindow, Chunker, JobId, MAX_CHUNK_SIZE, Provenance, SourceDescriptor, SourceKind,
    UnitId,
};
pub use dispatch::{CiAnnotationSink, Dispatcher, FindingRecord, JsonLinesSink, LegacyJsonSink, PlainTextSink};
pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, HandlerError, SourceError};
pub use executor::SpanPolicy;
pub use filters::ResultPolicy;
pub use finding::{Finding, FindingStatus, ParseFindingStatusError, redact};
pub use handler::HandlerLimits;
pub use metrics::Metrics;
pub use source::{
    BoxFuture, ChunkEmitter, FilesystemConfig, FilesystemSource, GitConfig, GitSource, JobProgressRef,
    JobProgressSnapshot, PathFilter, Source, SourceUnit, UnitError, UnitMetrics, UnitReporter,
};

pub use rummage_detectors::{
    Candidate, Detector, DetectorId, DetectorRegistry, RegistryError, Verification, VerificationError, Verifier,
    VerifierOutcome,
};
