//! Built-in detectors for credential discovery and verification.

mod ai;
mod cloud;
mod email;
mod generic;
mod messaging;
mod packages;
mod payments;
mod vcs;

use std::sync::Arc;

use crate::detector::Detector;

/// Returns the built-in detector catalogue, one entry per supported service.
///
/// Ids are stable across releases; new detectors are appended with fresh ids.
#[must_use]
pub fn builtin_detectors() -> Vec<Arc<dyn Detector>> {
    vec![
        Arc::new(cloud::AwsDetector),
        Arc::new(vcs::GitHubDetector),
        Arc::new(vcs::GitLabDetector),
        Arc::new(messaging::SlackWebhookDetector),
        Arc::new(payments::StripeDetector),
        Arc::new(email::SendGridDetector),
        Arc::new(email::MailgunDetector),
        Arc::new(packages::NpmDetector),
        Arc::new(ai::OpenAiDetector),
        Arc::new(generic::GenericApiKeyDetector),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_builtin_detector_has_a_unique_id() {
        let detectors = builtin_detectors();
        let ids: HashSet<_> = detectors.iter().map(|d| d.id()).collect();
        assert_eq!(ids.len(), detectors.len());
    }

    #[test]
    fn every_builtin_detector_has_a_nonempty_name() {
        for detector in builtin_detectors() {
            assert!(!detector.name().is_empty());
        }
    }

    #[test]
    fn keywords_are_declared_lowercase() {
        for detector in builtin_detectors() {
            for keyword in detector.keywords() {
                assert_eq!(
                    *keyword,
                    keyword.to_lowercase(),
                    "keyword '{keyword}' of '{}' must be lowercase",
                    detector.name()
                );
            }
        }
    }

    #[test]
    fn detectors_return_nothing_on_empty_input() {
        for detector in builtin_detectors() {
            assert!(detector.from_data(b"").is_empty());
        }
    }
}
