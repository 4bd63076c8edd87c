//! Result filters applied between detection and dispatch.
//!
//! Order is fixed: entropy, then per-(chunk, detector) unverified dedup,
//! then result-kind projection. Filters never block and have no side
//! effects beyond the findings vector they are handed.

use std::collections::HashSet;

use crate::entropy::shannon_entropy;
use crate::finding::{Finding, FindingStatus};

/// Post-detection filtering policy for one engine.
#[derive(Debug, Default, Clone)]
pub struct ResultPolicy {
    /// Drop unverified findings whose raw bytes fall below this Shannon
    /// entropy.
    pub filter_entropy: Option<f64>,
    /// Keep only the first unverified finding per (chunk, detector).
    pub filter_unverified: bool,
    /// Keep only findings whose status is in this set. Empty keeps all.
    pub results: HashSet<FindingStatus>,
}

impl ResultPolicy {
    /// Applies the policy to the findings of a single chunk, in place.
    pub fn apply(&self, findings: &mut Vec<Finding>) {
        // When the projection asks to see filtered findings, the first two
        // stages relabel instead of dropping.
        let keep_filtered = self.results.contains(&FindingStatus::FilteredUnverified);

        if let Some(threshold) = self.filter_entropy {
            self.apply_entropy(findings, threshold, keep_filtered);
        }
        if self.filter_unverified {
            self.apply_unverified_dedup(findings, keep_filtered);
        }
        if !self.results.is_empty() {
            findings.retain(|f| self.results.contains(&f.status));
        }
    }

    fn apply_entropy(&self, findings: &mut Vec<Finding>, threshold: f64, keep_filtered: bool) {
        findings.retain_mut(|f| {
            if f.status != FindingStatus::Unverified || shannon_entropy(f.raw.as_bytes()) >= threshold {
                return true;
            }
            if keep_filtered {
                f.status = FindingStatus::FilteredUnverified;
                true
            } else {
                false
            }
        });
    }

    fn apply_unverified_dedup(&self, findings: &mut Vec<Finding>, keep_filtered: bool) {
        let mut seen_detectors = HashSet::new();
        findings.retain_mut(|f| {
            if f.status != FindingStatus::Unverified || seen_detectors.insert(f.detector) {
                return true;
            }
            if keep_filtered {
                f.status = FindingStatus::FilteredUnverified;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Provenance, SourceDescriptor, SourceKind};
    use crate::finding::redact;
    use rummage_detectors::DetectorId;
    use std::sync::Arc;

    fn make_finding(detector: u32, raw: &str, status: FindingStatus) -> Finding {
        Finding {
            detector: DetectorId(detector),
            detector_name: "test",
            status,
            verification_error: None,
            raw: raw.into(),
            raw_v2: None,
            redacted: redact(raw).into(),
            extra: Vec::new(),
            source: SourceDescriptor {
                kind: SourceKind::Memory,
                name: Arc::from("mem"),
                id: 1,
            },
            provenance: Provenance::Memory {
                name: "blob".to_string(),
                line: 1,
            },
            decoder: None,
        }
    }

    #[test]
    fn entropy_filter_drops_low_entropy_unverified_findings() {
        let policy = ResultPolicy {
            filter_entropy: Some(3.0),
            ..ResultPolicy::default()
        };
        let mut findings = vec![make_finding(1, "aaaaaaaaaaaaaaaaaaaaaaaa", FindingStatus::Unverified)];
        policy.apply(&mut findings);
        assert!(findings.is_empty());
    }

    #[test]
    fn entropy_filter_keeps_high_entropy_findings() {
        let policy = ResultPolicy {
            filter_entropy: Some(3.0),
            ..ResultPolicy::default()
        };
        let mut findings = vec![make_finding(1, "wJalrXUtnFEMI/K7MDENG/bPx", FindingStatus::Unverified)];
        policy.apply(&mut findings);
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn entropy_filter_never_touches_verified_findings() {
        let policy = ResultPolicy {
            filter_entropy: Some(5.0),
            ..ResultPolicy::default()
        };
        let mut findings = vec![make_finding(1, "aaaaaaaaaaaaaaaaaaaaaaaa", FindingStatus::Verified)];
        policy.apply(&mut findings);
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn unverified_dedup_keeps_first_per_detector() {
        let policy = ResultPolicy {
            filter_unverified: true,
            ..ResultPolicy::default()
        };
        let mut findings = vec![
            make_finding(1, "first-unverified-aaaa", FindingStatus::Unverified),
            make_finding(1, "second-unverified-bbb", FindingStatus::Unverified),
            make_finding(2, "other-detector-cccccc", FindingStatus::Unverified),
        ];
        policy.apply(&mut findings);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].raw.as_ref(), "first-unverified-aaaa");
        assert_eq!(findings[1].detector, DetectorId(2));
    }

    #[test]
    fn unverified_dedup_passes_verified_findings_unconditionally() {
        let policy = ResultPolicy {
            filter_unverified: true,
            ..ResultPolicy::default()
        };
        let mut findings = vec![
            make_finding(1, "unverified-aaaaaaaaaa", FindingStatus::Unverified),
            make_finding(1, "verified-bbbbbbbbbbbb", FindingStatus::Verified),
            make_finding(1, "verified-cccccccccccc", FindingStatus::Verified),
        ];
        policy.apply(&mut findings);
        assert_eq!(findings.len(), 3);
    }

    #[test]
    fn projection_keeps_only_requested_statuses() {
        let policy = ResultPolicy {
            results: HashSet::from([FindingStatus::Verified]),
            ..ResultPolicy::default()
        };
        let mut findings = vec![
            make_finding(1, "verified-aaaaaaaaaaaa", FindingStatus::Verified),
            make_finding(2, "unverified-bbbbbbbbbb", FindingStatus::Unverified),
            make_finding(3, "unknown-ccccccccccccc", FindingStatus::Unknown),
        ];
        policy.apply(&mut findings);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].status, FindingStatus::Verified);
    }

    #[test]
    fn empty_projection_keeps_everything_that_survived() {
        let policy = ResultPolicy::default();
        let mut findings = vec![
            make_finding(1, "verified-aaaaaaaaaaaa", FindingStatus::Verified),
            make_finding(2, "unknown-cccccccccccccc", FindingStatus::Unknown),
        ];
        policy.apply(&mut findings);
        assert_eq!(findings.len(), 2);
    }

    #[test]
    fn filtered_projection_relabels_instead_of_dropping() {
        let policy = ResultPolicy {
            filter_entropy: Some(3.0),
            results: HashSet::from([FindingStatus::Verified, FindingStatus::FilteredUnverified]),
            ..ResultPolicy::default()
        };
        let mut findings = vec![make_finding(1, "aaaaaaaaaaaaaaaaaaaaaaaa", FindingStatus::Unverified)];
        policy.apply(&mut findings);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].status, FindingStatus::FilteredUnverified);
    }

    #[test]
    fn entropy_runs_before_dedup() {
        // The low-entropy first finding is removed by the entropy stage, so
        // the dedup stage sees the second one as the detector's first.
        let policy = ResultPolicy {
            filter_entropy: Some(3.0),
            filter_unverified: true,
            ..ResultPolicy::default()
        };
        let mut findings = vec![
            make_finding(1, "aaaaaaaaaaaaaaaaaaaaaaaa", FindingStatus::Unverified),
            make_finding(1, "wJalrXUtnFEMI/K7MDENG/bPx", FindingStatus::Unverified),
        ];
        policy.apply(&mut findings);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].raw.as_ref(), "wJalrXUtnFEMI/K7MDENG/bPx");
    }
}
