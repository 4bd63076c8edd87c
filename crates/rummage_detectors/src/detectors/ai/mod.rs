//! AI service credential detectors.

mod openai;

pub use openai::OpenAiDetector;
