//! Cloud provider credential detectors.

mod aws;

pub use aws::AwsDetector;
