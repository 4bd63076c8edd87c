//! Heuristic detectors for credentials without a vendor-specific shape.

mod api_key;

pub use api_key::GenericApiKeyDetector;
