//! Payment processor credential detectors.

mod stripe;

pub use stripe::StripeDetector;
