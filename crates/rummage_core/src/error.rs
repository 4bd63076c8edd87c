//! Error types for the scanning pipeline.

use thiserror::Error;

pub use rummage_detectors::{RegistryError, VerificationError};

/// Errors raised by source adapters.
///
/// Only [`SourceError::Config`] is fatal for a source; everything else is
/// recorded on the owning unit's progress and the scan continues.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The adapter configuration is invalid. Fails the whole source.
    #[error("invalid source configuration: {0}")]
    Config(String),

    /// An I/O operation against the source failed.
    #[error("source I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A git operation failed.
    #[error("git error: {0}")]
    Git(String),

    /// An object exceeded the configured size limit and was skipped.
    #[error("object '{name}' exceeds maximum size ({size} > {limit} bytes)")]
    ObjectTooLarge {
        /// Display name of the skipped object.
        name: String,
        /// Actual size in bytes.
        size: u64,
        /// Configured limit in bytes.
        limit: u64,
    },

    /// The scan was cancelled while the adapter was producing.
    #[error("scan cancelled")]
    Cancelled,
}

/// Errors raised while decoding an artifact in the handler layer.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Archive nesting exceeded the configured depth limit.
    #[error("archive nesting exceeds maximum depth {0}")]
    DepthExceeded(usize),

    /// A decompressed entry exceeded the per-level size ceiling.
    #[error("archive entry '{name}' exceeds maximum decompressed size {limit} bytes")]
    EntryTooLarge {
        /// Entry name within the archive.
        name: String,
        /// Configured per-level ceiling.
        limit: u64,
    },

    /// Decompression took longer than the configured timeout.
    #[error("archive extraction timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The format was recognised but is not decodable by this build.
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(&'static str),

    /// The archive was malformed.
    #[error("failed to decode {format} archive: {message}")]
    Decode {
        /// Format being decoded when the failure occurred.
        format: &'static str,
        /// Decoder error detail.
        message: String,
    },
}

/// Errors from constructing or driving the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Detector selection or endpoint configuration failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The HTTP verification client could not be constructed.
    #[error("failed to initialize verification client: {0}")]
    Client(String),

    /// An engine method was called in the wrong lifecycle state.
    #[error("operation '{operation}' is not legal in state {state}")]
    InvalidState {
        /// The attempted operation.
        operation: &'static str,
        /// The engine's current state.
        state: &'static str,
    },

    /// A source rejected its configuration at enrolment.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The scan was cancelled; carries the recorded cause.
    #[error("scan cancelled: {0}")]
    Cancelled(String),
}
