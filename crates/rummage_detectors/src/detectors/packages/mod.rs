//! Package registry credential detectors.

mod npm;

pub use npm::NpmDetector;
