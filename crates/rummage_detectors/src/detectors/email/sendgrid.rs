//! SendGrid API key detection and verification.

use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::USER_AGENT;
use crate::detector::{Candidate, Detector, DetectorId, candidates_from_regex};
use crate::verify::{BoxFuture, VerificationError, Verifier, VerifierOutcome};

const DEFAULT_ENDPOINT: &str = "https://api.sendgrid.com/v3/scopes";

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
    Regex::new(r"\b(SG\.[A-Za-z0-9_\-]{22}\.[A-Za-z0-9_\-]{43})\b").unwrap()
});

/// Detects SendGrid API keys.
pub struct SendGridDetector;

impl Detector for SendGridDetector {
    fn id(&self) -> DetectorId {
        DetectorId(6)
    }

    fn name(&self) -> &'static str {
        "sendgrid"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &["sg."]
    }

    fn from_data(&self, data: &[u8]) -> Vec<Candidate> {
        candidates_from_regex(&PATTERN, data)
    }

    fn verifier(&self) -> Option<&dyn Verifier> {
        Some(&SendGridVerifier)
    }
}

/// Verifies SendGrid keys by reading the key's scopes.
pub struct SendGridVerifier;

impl Verifier for SendGridVerifier {
    fn default_endpoint(&self) -> &'static str {
        DEFAULT_ENDPOINT
    }

    fn verify<'a>(
        &'a self,
        client: &'a reqwest::Client,
        secret: &'a str,
        endpoint: &'a str,
    ) -> BoxFuture<'a, Result<VerifierOutcome, VerificationError>> {
        Box::pin(async move {
            let response = client
                .get(endpoint)
                .bearer_auth(secret)
                .header("User-Agent", USER_AGENT)
                .send()
                .await?;

            match response.status().as_u16() {
                200 => {
                    let body: serde_json::Value = response.json().await?;
                    let mut outcome = VerifierOutcome::verified();
                    if let Some(scopes) = body.get("scopes").and_then(|v| v.as_array()) {
                        outcome = outcome.with_extra("scope_count", scopes.len().to_string());
                    }
                    Ok(outcome)
                }
                401 | 403 => Ok(VerifierOutcome::unverified()),
                other => Err(VerificationError::UnexpectedStatus(other)),
            }
        })
    }
}
