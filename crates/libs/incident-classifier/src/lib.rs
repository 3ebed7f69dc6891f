//! Incident Classifier
//!
//! Shared classification types for the transitwatch ingest service.
//! This crate provides:
//! - `ThreatLevel` / `Classification` - the verdict returned for one frame
//! - `Classifier` - blocking contract implemented by any vision backend
//! - `parse_verdict` - lenient parsing of model replies into a `Classification`
//! - `prepare_frame` - downscale + JPEG re-encode + base64 for remote backends
//! - `HttpClassifier` - a `Classifier` that posts frames to an HTTP vision endpoint
//!
//! # Usage
//!
//! ```rust
//! use transitwatch_classifier::{parse_verdict, ThreatLevel};
//!
//! let verdict = parse_verdict(r#"{"level": "dangerous", "reason": "crowd surge"}"#).unwrap();
//! assert_eq!(verdict.level, ThreatLevel::Dangerous);
//! ```

mod classifier;
mod frame;
mod http;
mod level;
mod verdict;

pub use classifier::{Classifier, ClassifierError};
pub use frame::{decode_frame, prepare_frame, PreparedFrame};
pub use http::{HttpClassifier, HttpClassifierConfig, DEFAULT_PROMPT};
pub use level::{Classification, ThreatLevel};
pub use verdict::{extract_verdict, parse_verdict};

/// Re-exported so implementors do not need a direct `image` dependency
pub use image::DynamicImage;
