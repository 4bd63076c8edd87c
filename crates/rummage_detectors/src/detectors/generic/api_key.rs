//! Generic assignment-based credential detection.

use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::detector::{Candidate, Detector, DetectorId, candidates_from_regex};

// Value class deliberately excludes '.' and whitespace so the capture stops
// at sentence punctuation and structured separators.
static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
    Regex::new(
        r#"(?i)(?:api[_-]?key|apikey|secret|token|password|passwd)\s*[=:]\s*["']?([A-Za-z0-9_\-/+=]{16,64})["']?"#,
    )
    .unwrap()
});

/// Matches `key = value` style assignments where the key name suggests a
/// credential.
///
/// High-noise by design; downstream entropy filtering and overlap
/// resolution against vendor-specific detectors keep the output usable.
pub struct GenericApiKeyDetector;

impl Detector for GenericApiKeyDetector {
    fn id(&self) -> DetectorId {
        DetectorId(10)
    }

    fn name(&self) -> &'static str {
        "generic-api-key"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &["api_key", "api-key", "apikey", "secret", "token", "password", "passwd"]
    }

    fn from_data(&self, data: &[u8]) -> Vec<Candidate> {
        candidates_from_regex(&PATTERN, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_quoted_assignment() {
        let found = GenericApiKeyDetector.from_data(br#"api_key = "f3fb7a2b9c4d4e5f6a7b8c9d""#);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw.as_ref(), "f3fb7a2b9c4d4e5f6a7b8c9d");
    }

    #[test]
    fn detects_unquoted_password_assignment() {
        let found = GenericApiKeyDetector.from_data(b"password=aaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw.as_ref(), "aaaaaaaaaaaaaaaaaaaaaaaa");
    }

    #[test]
    fn detects_colon_separated_yaml_style() {
        let found = GenericApiKeyDetector.from_data(b"secret: Zm9vYmFyYmF6cXV4MTIzNDU2");
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn ignores_short_values() {
        assert!(GenericApiKeyDetector.from_data(b"token=abc123").is_empty());
    }

    #[test]
    fn ignores_assignments_with_unrelated_key_names() {
        assert!(
            GenericApiKeyDetector
                .from_data(b"username=somebody_interesting_here")
                .is_empty()
        );
    }

    #[test]
    fn has_no_verifier() {
        assert!(GenericApiKeyDetector.verifier().is_none());
    }
}
