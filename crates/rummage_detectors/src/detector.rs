//! The detector contract.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::verify::Verifier;

/// Stable numeric identifier of a detector.
///
/// Ids never change once assigned; selection filters, the verification
/// cache, and overlap tie-breaking all key on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectorId(pub u32);

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A credential matched by a detector within a block of scanned bytes.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The canonical credential bytes as matched.
    pub raw: Box<str>,
    /// Composite form when a credential has multiple parts (e.g. a key id
    /// paired with its secret). Absent for single-part credentials.
    pub raw_v2: Option<Box<str>>,
    /// Byte span of the match within the scanned data.
    pub span: Range<usize>,
    /// Additional structured fields extracted at match time.
    pub extra: Vec<(&'static str, String)>,
}

impl Candidate {
    /// Creates a candidate from matched text and its span.
    #[must_use]
    pub fn new(raw: &str, span: Range<usize>) -> Self {
        Self {
            raw: raw.into(),
            raw_v2: None,
            span,
            extra: Vec::new(),
        }
    }

    /// Attaches a composite credential form.
    #[must_use]
    pub fn with_raw_v2(mut self, raw_v2: String) -> Self {
        self.raw_v2 = Some(raw_v2.into());
        self
    }

    /// Attaches an extra structured field.
    #[must_use]
    pub fn with_extra(mut self, key: &'static str, value: String) -> Self {
        self.extra.push((key, value));
        self
    }
}

/// A credential detector.
///
/// Detectors are pure pattern matchers: [`Detector::from_data`] must not
/// perform I/O. Network access is confined to the optional [`Verifier`].
/// Implementations are shared read-only across the scanning pool and must
/// be cheap to call repeatedly.
pub trait Detector: Send + Sync {
    /// Returns the stable numeric id of this detector.
    fn id(&self) -> DetectorId;

    /// Returns the short lowercase name (e.g. `"github"`).
    fn name(&self) -> &'static str;

    /// Returns the keyword set used for pre-filtering. A chunk that
    /// contains none of these (case-insensitive) is never handed to
    /// [`Detector::from_data`]. An empty slice disables pre-filtering.
    fn keywords(&self) -> &'static [&'static str];

    /// Detector version, bumped when the pattern set changes meaning.
    fn version(&self) -> u32 {
        1
    }

    /// Scans `data` and returns every credential candidate found.
    fn from_data(&self, data: &[u8]) -> Vec<Candidate>;

    /// Returns the live verifier for this detector, if it has one.
    fn verifier(&self) -> Option<&dyn Verifier> {
        None
    }
}

/// Finds every match of `regex` in `data` and maps capture group 1 (or the
/// whole match) to a [`Candidate`].
///
/// Shared by detectors whose pattern is a single regex with the credential
/// in the first capture group.
#[must_use]
pub fn candidates_from_regex(regex: &regex::bytes::Regex, data: &[u8]) -> Vec<Candidate> {
    regex
        .captures_iter(data)
        .filter_map(|caps| {
            let m = caps.get(1).or_else(|| caps.get(0))?;
            let raw = std::str::from_utf8(m.as_bytes()).ok()?;
            Some(Candidate::new(raw, m.start()..m.end()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::bytes::Regex;

    #[test]
    fn detector_id_displays_as_plain_number() {
        assert_eq!(format!("{}", DetectorId(42)), "42");
    }

    #[test]
    fn detector_ids_order_numerically() {
        assert!(DetectorId(2) < DetectorId(10));
    }

    #[test]
    fn candidate_new_records_raw_and_span() {
        let c = Candidate::new("tok_abc", 5..12);
        assert_eq!(c.raw.as_ref(), "tok_abc");
        assert_eq!(c.span, 5..12);
        assert!(c.raw_v2.is_none());
        assert!(c.extra.is_empty());
    }

    #[test]
    fn candidate_builders_attach_raw_v2_and_extra() {
        let c = Candidate::new("key", 0..3)
            .with_raw_v2("key:secret".to_string())
            .with_extra("account", "acme".to_string());
        assert_eq!(c.raw_v2.as_deref(), Some("key:secret"));
        assert_eq!(c.extra, vec![("account", "acme".to_string())]);
    }

    #[test]
    fn candidates_from_regex_uses_first_capture_group() {
        let re = Regex::new(r"token=(\w{8})").unwrap();
        let found = candidates_from_regex(&re, b"token=abcd1234 rest");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw.as_ref(), "abcd1234");
        assert_eq!(found[0].span, 6..14);
    }

    #[test]
    fn candidates_from_regex_falls_back_to_whole_match() {
        let re = Regex::new(r"ghx_\w{4}").unwrap();
        let found = candidates_from_regex(&re, b"ghx_abcd");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw.as_ref(), "ghx_abcd");
    }

    #[test]
    fn candidates_from_regex_returns_every_match() {
        let re = Regex::new(r"(tok_\d{4})").unwrap();
        let found = candidates_from_regex(&re, b"tok_1111 then tok_2222");
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn candidates_from_regex_skips_invalid_utf8_matches() {
        let re = Regex::new(r"(?-u)key=(.{4})").unwrap();
        let found = candidates_from_regex(&re, b"key=\xff\xfe\xfd\xfc");
        assert!(found.is_empty());
    }
}
