//! Credential verification types and traits.

use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A pinned, boxed, `Send` future used as the return type for async verification.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors that can occur during credential verification.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// The HTTP client could not be initialised.
    #[error("failed to initialize HTTP client: {0}")]
    ClientInit(String),

    /// An HTTP request to the issuing service failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The verification request exceeded the configured timeout.
    #[error("verification timed out after {0:?}")]
    Timeout(Duration),

    /// The service asked us to back off.
    #[error("rate limited by service{}", retry_after.map(|d| format!(", retry after {d:?}")).unwrap_or_default())]
    RateLimited {
        /// Suggested delay from the `Retry-After` header, if present.
        retry_after: Option<Duration>,
    },

    /// The service answered with a status code the verifier cannot interpret.
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),
}

/// The tri-state outcome of checking a credential against its issuing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verification {
    /// The credential is live and grants access.
    Verified,
    /// The credential was rejected by the service.
    Unverified,
    /// Verification was not attempted or could not reach a conclusion.
    Unknown,
}

impl std::fmt::Display for Verification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Verified => write!(f, "verified"),
            Self::Unverified => write!(f, "unverified"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// What a verifier learned about a credential.
#[derive(Debug, Clone)]
pub struct VerifierOutcome {
    /// Whether the credential is live, rejected, or inconclusive.
    pub verification: Verification,
    /// Structured fields learned during the check (account id, scopes, …).
    pub extra: Vec<(&'static str, String)>,
}

impl VerifierOutcome {
    /// Creates an outcome for a live credential.
    #[must_use]
    pub fn verified() -> Self {
        Self {
            verification: Verification::Verified,
            extra: Vec::new(),
        }
    }

    /// Creates an outcome for a rejected credential.
    #[must_use]
    pub fn unverified() -> Self {
        Self {
            verification: Verification::Unverified,
            extra: Vec::new(),
        }
    }

    /// Creates an inconclusive outcome with a reason.
    #[must_use]
    pub fn unknown(reason: &str) -> Self {
        Self {
            verification: Verification::Unknown,
            extra: vec![("reason", reason.to_string())],
        }
    }

    /// Attaches a structured field to the outcome.
    #[must_use]
    pub fn with_extra(mut self, key: &'static str, value: String) -> Self {
        self.extra.push((key, value));
        self
    }
}

/// Trait for detectors that can check whether a credential is still active.
///
/// A verifier owns exactly one service endpoint shape; the concrete URL is
/// passed in so the registry can substitute user-configured endpoints.
pub trait Verifier: Send + Sync {
    /// Returns the service URL used when no custom endpoint is configured.
    fn default_endpoint(&self) -> &'static str;

    /// Checks the credential against `endpoint` and reports the outcome.
    fn verify<'a>(
        &'a self,
        client: &'a reqwest::Client,
        secret: &'a str,
        endpoint: &'a str,
    ) -> BoxFuture<'a, Result<VerifierOutcome, VerificationError>>;
}

/// Reads a `Retry-After` header as a whole-second duration.
#[must_use]
pub(crate) fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
