//! Detector registry with selection filtering and verifier endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use crate::detector::{Detector, DetectorId};
use crate::detectors::builtin_detectors;
use crate::verify::{Verification, VerificationError, VerifierOutcome};

/// Errors from assembling or configuring a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A selector named a detector that does not exist.
    #[error("unknown detector selector '{0}': expected a name, numeric id, or 'lo-hi' range")]
    UnknownSelector(String),

    /// A range selector was malformed or inverted.
    #[error("invalid detector range '{0}'")]
    InvalidRange(String),

    /// Filtering removed every detector.
    #[error("detector selection is empty after applying include/exclude filters")]
    EmptySelection,

    /// Two registered detectors claim the same numeric id.
    #[error("duplicate detector id {id} ({first} and {second})")]
    DuplicateId {
        /// The contested id.
        id: DetectorId,
        /// Name of the detector registered first.
        first: &'static str,
        /// Name of the detector registered second.
        second: &'static str,
    },

    /// A custom verifier endpoint names a detector without verification support.
    #[error("detector '{0}' does not support verification")]
    NotVerifiable(String),
}

/// Central catalogue of enabled detectors.
///
/// Construction starts from the built-in set (plus any custom detectors),
/// then applies the include filter followed by the exclude filter. Custom
/// verifier endpoints may replace or extend a detector's default
/// verification URL.
pub struct DetectorRegistry {
    detectors: Vec<Arc<dyn Detector>>,
    endpoints: HashMap<DetectorId, Vec<String>>,
    custom_verifiers_only: bool,
}

impl DetectorRegistry {
    /// Creates a registry containing every built-in detector.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateId`] if the catalogue is internally
    /// inconsistent.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::with_detectors(builtin_detectors())
    }

    /// Creates a registry from an explicit detector list.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateId`] when two detectors share an id.
    pub fn with_detectors(detectors: Vec<Arc<dyn Detector>>) -> Result<Self, RegistryError> {
        let mut seen: HashMap<DetectorId, &'static str> = HashMap::new();
        for detector in &detectors {
            if let Some(first) = seen.insert(detector.id(), detector.name()) {
                return Err(RegistryError::DuplicateId {
                    id: detector.id(),
                    first,
                    second: detector.name(),
                });
            }
        }

        Ok(Self {
            detectors,
            endpoints: HashMap::new(),
            custom_verifiers_only: false,
        })
    }

    /// Applies include/exclude selection filters.
    ///
    /// `include` is evaluated first (`"all"` or empty keeps everything);
    /// `exclude` is evaluated second and always wins. Both lists are
    /// comma-separated and accept detector names, numeric ids, or inclusive
    /// `lo-hi` ranges.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown selectors, malformed ranges, or a
    /// selection that ends up empty.
    pub fn filtered(mut self, include: &str, exclude: &str) -> Result<Self, RegistryError> {
        let include = include.trim();
        if !include.is_empty() && !include.eq_ignore_ascii_case("all") {
            let keep = self.resolve_selectors(include)?;
            self.detectors.retain(|d| keep.contains(&d.id()));
        }

        let exclude = exclude.trim();
        if !exclude.is_empty() {
            let drop = self.resolve_selectors(exclude)?;
            self.detectors.retain(|d| !drop.contains(&d.id()));
        }

        if self.detectors.is_empty() {
            return Err(RegistryError::EmptySelection);
        }

        Ok(self)
    }

    /// Replaces or extends a detector's verification endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error when the selector is unknown or the detector has no
    /// verifier.
    pub fn set_verifier_endpoints(&mut self, selector: &str, urls: Vec<String>) -> Result<(), RegistryError> {
        let ids = self.resolve_selectors(selector)?;
        for id in ids {
            let detector = self
                .detectors
                .iter()
                .find(|d| d.id() == id)
                .ok_or_else(|| RegistryError::UnknownSelector(selector.to_string()))?;
            if detector.verifier().is_none() {
                return Err(RegistryError::NotVerifiable(detector.name().to_string()));
            }
            self.endpoints.entry(id).or_default().extend(urls.iter().cloned());
        }
        Ok(())
    }

    /// When set, detectors with custom endpoints skip their default
    /// endpoint entirely.
    pub fn set_custom_verifiers_only(&mut self, only: bool) {
        self.custom_verifiers_only = only;
    }

    /// Returns the enabled detectors.
    #[must_use]
    pub fn detectors(&self) -> &[Arc<dyn Detector>] {
        &self.detectors
    }

    /// Looks up a detector by numeric id.
    #[must_use]
    pub fn get(&self, id: DetectorId) -> Option<&Arc<dyn Detector>> {
        self.detectors.iter().find(|d| d.id() == id)
    }

    /// Returns the number of enabled detectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    /// Returns `true` if no detectors are enabled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Returns the verification URLs to try for a detector, custom
    /// endpoints first.
    #[must_use]
    pub fn verification_endpoints(&self, id: DetectorId) -> Vec<String> {
        let custom = self.endpoints.get(&id);
        let mut urls: Vec<String> = custom.map(|v| v.clone()).unwrap_or_default();

        let use_default = !(self.custom_verifiers_only && custom.is_some());
        if use_default
            && let Some(detector) = self.get(id)
            && let Some(verifier) = detector.verifier()
        {
            urls.push(verifier.default_endpoint().to_string());
        }

        urls
    }

    /// Verifies a credential through the detector's endpoints.
    ///
    /// Endpoints are tried in order; the first live outcome wins, otherwise
    /// the last outcome is returned.
    ///
    /// # Errors
    ///
    /// Returns the last verification error when every endpoint fails.
    pub async fn verify(
        &self,
        client: &reqwest::Client,
        id: DetectorId,
        secret: &str,
    ) -> Result<VerifierOutcome, VerificationError> {
        let detector = self.get(id).ok_or_else(|| {
            VerificationError::ClientInit(format!("detector {id} is not enabled"))
        })?;
        let verifier = detector.verifier().ok_or_else(|| {
            VerificationError::ClientInit(format!("detector '{}' has no verifier", detector.name()))
        })?;

        let endpoints = self.verification_endpoints(id);
        let mut last: Option<Result<VerifierOutcome, VerificationError>> = None;

        for endpoint in &endpoints {
            let result = verifier.verify(client, secret, endpoint).await;
            if matches!(&result, Ok(o) if o.verification == Verification::Verified) {
                return result;
            }
            last = Some(result);
        }

        last.unwrap_or_else(|| {
            Err(VerificationError::ClientInit(format!(
                "no verification endpoint configured for '{}'",
                detector.name()
            )))
        })
    }

    fn resolve_selectors(&self, list: &str) -> Result<Vec<DetectorId>, RegistryError> {
        let mut ids = Vec::new();
        for selector in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            self.resolve_selector(selector, &mut ids)?;
        }
        Ok(ids)
    }

    fn resolve_selector(&self, selector: &str, out: &mut Vec<DetectorId>) -> Result<(), RegistryError> {
        if let Some((lo, hi)) = selector.split_once('-')
            && let (Ok(lo), Ok(hi)) = (lo.trim().parse::<u32>(), hi.trim().parse::<u32>())
        {
            if lo > hi {
                return Err(RegistryError::InvalidRange(selector.to_string()));
            }
            out.extend((lo..=hi).map(DetectorId));
            return Ok(());
        }

        if let Ok(id) = selector.parse::<u32>() {
            out.push(DetectorId(id));
            return Ok(());
        }

        let named = self
            .detectors
            .iter()
            .find(|d| d.name().eq_ignore_ascii_case(selector))
            .ok_or_else(|| RegistryError::UnknownSelector(selector.to_string()))?;
        out.push(named.id());
        Ok(())
    }
}

impl std::fmt::Debug for DetectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorRegistry")
            .field("detectors", &self.detectors.len())
            .field("custom_endpoints", &self.endpoints.len())
            .field("custom_verifiers_only", &self.custom_verifiers_only)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_is_not_empty() {
        let registry = DetectorRegistry::builtin().unwrap();
        assert!(!registry.is_empty());
    }

    #[test]
    fn builtin_registry_has_unique_ids() {
        // with_detectors would have failed on a duplicate
        assert!(DetectorRegistry::builtin().is_ok());
    }

    #[test]
    fn include_all_keeps_every_detector() {
        let full = DetectorRegistry::builtin().unwrap().len();
        let registry = DetectorRegistry::builtin().unwrap().filtered("all", "").unwrap();
        assert_eq!(registry.len(), full);
    }

    #[test]
    fn include_by_name_is_case_insensitive() {
        let registry = DetectorRegistry::builtin().unwrap().filtered("GitHub", "").unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.detectors()[0].name(), "github");
    }

    #[test]
    fn include_by_numeric_id_selects_one_detector() {
        let registry = DetectorRegistry::builtin().unwrap().filtered("2", "").unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.detectors()[0].id(), DetectorId(2));
    }

    #[test]
    fn include_by_range_selects_inclusive_span() {
        let registry = DetectorRegistry::builtin().unwrap().filtered("1-3", "").unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn exclude_wins_over_include() {
        let registry = DetectorRegistry::builtin()
            .unwrap()
            .filtered("1-3", "2")
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get(DetectorId(2)).is_none());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = DetectorRegistry::builtin().unwrap().filtered("9-1", "").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRange(_)));
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = DetectorRegistry::builtin()
            .unwrap()
            .filtered("definitely-not-a-detector", "")
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownSelector(_)));
    }

    #[test]
    fn excluding_everything_is_an_error() {
        let err = DetectorRegistry::builtin()
            .unwrap()
            .filtered("github", "github")
            .unwrap_err();
        assert!(matches!(err, RegistryError::EmptySelection));
    }

    #[test]
    fn verification_endpoints_default_to_the_verifier_url() {
        let registry = DetectorRegistry::builtin().unwrap();
        let github = registry
            .detectors()
            .iter()
            .find(|d| d.name() == "github")
            .unwrap()
            .id();
        let urls = registry.verification_endpoints(github);
        assert_eq!(urls.len(), 1);
        assert!(urls[0].starts_with("https://"));
    }

    #[test]
    fn custom_endpoint_is_tried_before_the_default() {
        let mut registry = DetectorRegistry::builtin().unwrap();
        registry
            .set_verifier_endpoints("github", vec!["https://ghe.internal/api/v3/user".to_string()])
            .unwrap();
        let github = registry
            .detectors()
            .iter()
            .find(|d| d.name() == "github")
            .unwrap()
            .id();
        let urls = registry.verification_endpoints(github);
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0], "https://ghe.internal/api/v3/user");
    }

    #[test]
    fn custom_verifiers_only_drops_the_default_endpoint() {
        let mut registry = DetectorRegistry::builtin().unwrap();
        registry
            .set_verifier_endpoints("github", vec!["https://ghe.internal/api/v3/user".to_string()])
            .unwrap();
        registry.set_custom_verifiers_only(true);
        let github = registry
            .detectors()
            .iter()
            .find(|d| d.name() == "github")
            .unwrap()
            .id();
        let urls = registry.verification_endpoints(github);
        assert_eq!(urls, vec!["https://ghe.internal/api/v3/user".to_string()]);
    }

    #[test]
    fn custom_verifiers_only_keeps_default_when_no_custom_endpoint_exists() {
        let mut registry = DetectorRegistry::builtin().unwrap();
        registry.set_custom_verifiers_only(true);
        let github = registry
            .detectors()
            .iter()
            .find(|d| d.name() == "github")
            .unwrap()
            .id();
        assert_eq!(registry.verification_endpoints(github).len(), 1);
    }

    #[test]
    fn endpoint_override_for_unverifiable_detector_is_rejected() {
        let mut registry = DetectorRegistry::builtin().unwrap();
        let err = registry
            .set_verifier_endpoints("aws", vec!["https://example.com".to_string()])
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotVerifiable(_)));
    }

    #[test]
    fn debug_impl_shows_detector_count() {
        let registry = DetectorRegistry::builtin().unwrap();
        let debug = format!("{registry:?}");
        assert!(debug.contains("DetectorRegistry"));
        assert!(debug.contains("detectors"));
    }
}
