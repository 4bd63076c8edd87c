//! Slack incoming-webhook detection and verification.

use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::USER_AGENT;
use crate::detector::{Candidate, Detector, DetectorId, candidates_from_regex};
use crate::verify::{BoxFuture, VerificationError, Verifier, VerifierOutcome};

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
    Regex::new(r"(https://hooks\.slack\.com/services/T[A-Za-z0-9_]{8,}/B[A-Za-z0-9_]{8,}/[A-Za-z0-9_]{20,})").unwrap()
});

/// Detects Slack incoming-webhook URLs.
pub struct SlackWebhookDetector;

impl Detector for SlackWebhookDetector {
    fn id(&self) -> DetectorId {
        DetectorId(4)
    }

    fn name(&self) -> &'static str {
        "slack-webhook"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &["hooks.slack.com"]
    }

    fn from_data(&self, data: &[u8]) -> Vec<Candidate> {
        candidates_from_regex(&PATTERN, data)
    }

    fn verifier(&self) -> Option<&dyn Verifier> {
        Some(&SlackWebhookVerifier)
    }
}

/// Verifies webhook URLs by posting an intentionally empty payload.
///
/// The URL itself is the credential, so the probe goes to the matched URL
/// rather than the configured endpoint. Slack answers `no_text` for a live
/// webhook handed an empty message, which confirms validity without
/// posting anything visible.
pub struct SlackWebhookVerifier;

impl Verifier for SlackWebhookVerifier {
    fn default_endpoint(&self) -> &'static str {
        "https://hooks.slack.com"
    }

    fn verify<'a>(
        &'a self,
        client: &'a reqwest::Client,
        secret: &'a str,
        _endpoint: &'a str,
    ) -> BoxFuture<'a, Result<VerifierOutcome, VerificationError>> {
        Box::pin(async move {
            let response = client
                .post(secret)
                .header("User-Agent", USER_AGENT)
                .json(&serde_json::json!({"text": ""}))
                .send()
                .await?;

            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();

            match status {
                200 => Ok(VerifierOutcome::verified()),
                400 if body.contains("no_text") || body.contains("missing_text") => {
                    Ok(VerifierOutcome::verified())
                }
                400 | 403 | 404 => Ok(VerifierOutcome::unverified()),
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

    const SAMPLE: &str = "https://hooks.slack.com/services/T12345678/B12345678/abcdefghij1234567890";

    #[test]
    fn detects_webhook_url() {
        let data = format!("webhook = {SAMPLE}");
        let found = SlackWebhookDetector.from_data(data.as_bytes());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw.as_ref(), SAMPLE);
    }

    #[test]
    fn ignores_non_service_slack_urls() {
        assert!(
            SlackWebhookDetector
                .from_data(b"https://hooks.slack.com/something/else")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn live_webhook_rejecting_empty_text_is_verified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/T1/B1/secret"))
            .respond_with(ResponseTemplate::new(400).set_body_string("no_text"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/services/T1/B1/secret", server.uri());
        let outcome = SlackWebhookVerifier.verify(&client, &url, "").await.unwrap();

        assert_eq!(outcome.verification, Verification::Verified);
    }

    #[tokio::test]
    async fn deleted_webhook_is_unverified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/T1/B1/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no_service"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/services/T1/B1/gone", server.uri());
        let outcome = SlackWebhookVerifier.verify(&client, &url, "").await.unwrap();

        assert_eq!(outcome.verification, Verification::Unverified);
    }
}
