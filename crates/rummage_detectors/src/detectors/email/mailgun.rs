//! Mailgun API key detection and verification.

use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::USER_AGENT;
use crate::detector::{Candidate, Detector, DetectorId, candidates_from_regex};
use crate::verify::{BoxFuture, VerificationError, Verifier, VerifierOutcome};

const DEFAULT_ENDPOINT: &str = "https://api.mailgun.net/v3/domains";

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
    Regex::new(r"\b(key-[a-z0-9]{32})\b").unwrap()
});

/// Detects Mailgun private API keys.
pub struct MailgunDetector;

impl Detector for MailgunDetector {
    fn id(&self) -> DetectorId {
        DetectorId(7)
    }

    fn name(&self) -> &'static str {
        "mailgun"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &["key-"]
    }

    fn from_data(&self, data: &[u8]) -> Vec<Candidate> {
        candidates_from_regex(&PATTERN, data)
    }

    fn verifier(&self) -> Option<&dyn Verifier> {
        Some(&MailgunVerifier)
    }
}

/// Verifies Mailgun keys by listing domains with HTTP basic auth.
pub struct MailgunVerifier;

impl Verifier for MailgunVerifier {
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
                .basic_auth("api", Some(secret))
                .header("User-Agent", USER_AGENT)
                .send()
                .await?;

            match response.status().as_u16() {
                200 => Ok(VerifierOutcome::verified()),
                401 => Ok(VerifierOutcome::unverified()),
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
    fn detects_private_api_key() {
        let key = format!("key-{}", "0a1b2c3d".repeat(4));
        let found = MailgunDetector.from_data(format!("MAILGUN_KEY={key}").as_bytes());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw.as_ref(), key);
    }

    #[test]
    fn ignores_uppercase_key_bodies() {
        assert!(
            MailgunDetector
                .from_data(b"key-ABCDEF0123456789ABCDEF0123456789")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn revoked_key_is_unverified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/domains"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let endpoint = format!("{}/v3/domains", server.uri());
        let outcome = MailgunVerifier.verify(&client, "key-x", &endpoint).await.unwrap();

        assert_eq!(outcome.verification, Verification::Unverified);
    }
}
