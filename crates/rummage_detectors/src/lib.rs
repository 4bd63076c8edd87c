//! Detector catalogue and credential verification for rummage.
//!
//! This crate provides the [`Detector`] contract, the built-in detector
//! catalogue, and optional live verification of detected credentials
//! against their issuing services.
//!
//! # Main Types
//!
//! - [`Detector`] - Pattern matching plus an optional [`Verifier`]
//! - [`DetectorRegistry`] - Built-in catalogue with include/exclude filtering
//! - [`Candidate`] - A matched credential with its byte span
//! - [`Verification`] - Tri-state outcome of a live check
//!
//! # Error Handling
//!
//! This crate uses [`thiserror`] for structured, typed errors:
//!
//! - [`RegistryError`] - Detector selection and endpoint configuration failures
//! - [`VerificationError`] - Live verification failures

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod detector;
/// Built-in detectors organised by service category.
pub mod detectors;
mod registry;
mod verify;

pub use detector::{Candidate, Detector, DetectorId, candidates_from_regex};
pub use registry::{DetectorRegistry, RegistryError};
pub use verify::{BoxFuture, Verification, VerificationError, Verifier, VerifierOutcome};

/// HTTP `User-Agent` header sent during credential verification requests.
pub const USER_AGENT: &str = concat!("rummage-scanner/", env!("CARGO_PKG_VERSION"));
