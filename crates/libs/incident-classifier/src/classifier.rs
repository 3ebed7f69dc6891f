//! Classifier contract
//!
//! This module defines the `Classifier` trait consumed by the ingest
//! service's classification throttle.

use image::DynamicImage;

use crate::Classification;

/// A vision backend that assigns a threat level to a decoded frame.
///
/// Calls are blocking and may be slow or billed per call; the caller is
/// responsible for running them off latency-sensitive paths and for
/// bounding how often they happen.
pub trait Classifier: Send + Sync {
    /// Analyse one decoded frame
    fn analyze(&self, frame: &DynamicImage) -> Result<Classification, ClassifierError>;

    /// Short backend name for logs and status output
    fn name(&self) -> &str {
        "classifier"
    }
}

/// Error type for classifier operations
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Frame decode error: {0}")]
    Decode(String),

    #[error("Frame encode error: {0}")]
    Encode(String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Endpoint returned HTTP status {0}")]
    Status(u16),

    #[error("Unparseable verdict: {0}")]
    Parse(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<reqwest::Error> for ClassifierError {
    fn from(e: reqwest::Error) -> Self {
        ClassifierError::Request(e.to_string())
    }
}
