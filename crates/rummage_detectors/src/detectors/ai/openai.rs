//! OpenAI API key detection and verification.

use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::USER_AGENT;
use crate::detector::{Candidate, Detector, DetectorId, candidates_from_regex};
use crate::verify::{BoxFuture, VerificationError, Verifier, VerifierOutcome};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/models";

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
    Regex::new(r"\b(sk-[A-Za-z0-9]{20}T3BlbkFJ[A-Za-z0-9]{20})\b").unwrap()
});

/// Detects OpenAI API keys by their fixed `T3BlbkFJ` infix.
pub struct OpenAiDetector;

impl Detector for OpenAiDetector {
    fn id(&self) -> DetectorId {
        DetectorId(9)
    }

    fn name(&self) -> &'static str {
        "openai"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &["t3blbkfj"]
    }

    fn from_data(&self, data: &[u8]) -> Vec<Candidate> {
        candidates_from_regex(&PATTERN, data)
    }

    fn verifier(&self) -> Option<&dyn Verifier> {
        Some(&OpenAiVerifier)
    }
}

/// Verifies OpenAI keys by listing models.
pub struct OpenAiVerifier;

impl Verifier for OpenAiVerifier {
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
                200 => Ok(VerifierOutcome::verified()),
                401 => Ok(VerifierOutcome::unverified()),
                429 => Ok(VerifierOutcome::verified().with_extra("note", "quota exhausted".to_string())),
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

    fn sample_key() -> String {
        format!("sk-{}T3BlbkFJ{}", "a1B2c3D4e5F6g7H8i9J0", "k1L2m3N4o5P6q7R8s9T0")
    }

    #[test]
    fn detects_api_key_with_fixed_infix() {
        let found = OpenAiDetector.from_data(format!("OPENAI_API_KEY={}", sample_key()).as_bytes());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw.as_ref(), sample_key());
    }

    #[test]
    fn ignores_generic_sk_prefixed_strings() {
        assert!(
            OpenAiDetector
                .from_data(b"sk-abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGH")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn exhausted_quota_still_verifies_the_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let endpoint = format!("{}/v1/models", server.uri());
        let outcome = OpenAiVerifier.verify(&client, &sample_key(), &endpoint).await.unwrap();

        assert_eq!(outcome.verification, Verification::Verified);
    }
}
