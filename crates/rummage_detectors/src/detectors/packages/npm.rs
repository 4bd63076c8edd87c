//! npm access token detection and verification.

use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::USER_AGENT;
use crate::detector::{Candidate, Detector, DetectorId, candidates_from_regex};
use crate::verify::{BoxFuture, VerificationError, Verifier, VerifierOutcome};

const DEFAULT_ENDPOINT: &str = "https://registry.npmjs.org/-/whoami";

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
    Regex::new(r"\b(npm_[A-Za-z0-9]{36})\b").unwrap()
});

/// Detects npm granular and classic access tokens.
pub struct NpmDetector;

impl Detector for NpmDetector {
    fn id(&self) -> DetectorId {
        DetectorId(8)
    }

    fn name(&self) -> &'static str {
        "npm"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &["npm_"]
    }

    fn from_data(&self, data: &[u8]) -> Vec<Candidate> {
        candidates_from_regex(&PATTERN, data)
    }

    fn verifier(&self) -> Option<&dyn Verifier> {
        Some(&NpmVerifier)
    }
}

/// Verifies npm tokens via the registry's `whoami` endpoint.
pub struct NpmVerifier;

impl Verifier for NpmVerifier {
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
                    if let Some(username) = body.get("username").and_then(|v| v.as_str()) {
                        outcome = outcome.with_extra("account", username.to_string());
                    }
                    Ok(outcome)
                }
                401 | 403 => Ok(VerifierOutcome::unverified()),
                other => Err(VerificationError::UnexpectedStatus(other)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::Verification;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn detects_access_token() {
        let token = format!("npm_{}", "Ab1".repeat(12));
        let found = NpmDetector.from_data(format!("//registry.npmjs.org/:_authToken={token}").as_bytes());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw.as_ref(), token);
    }

    #[test]
    fn ignores_short_tokens() {
        assert!(NpmDetector.from_data(b"npm_short").is_empty());
    }

    #[tokio::test]
    async fn live_token_reports_account() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/-/whoami"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"username": "publisher"})))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let endpoint = format!("{}/-/whoami", server.uri());
        let outcome = NpmVerifier.verify(&client, "npm_x", &endpoint).await.unwrap();

        assert_eq!(outcome.verification, Verification::Verified);
        assert!(outcome.extra.contains(&("account", "publisher".to_string())));
    }
}
