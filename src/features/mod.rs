//! Feature extraction
//!
//! Turns per-flow state into named feature vectors and projects them onto
//! the ordered schemas the classifiers expect.

pub mod extractor;
pub mod profile;
pub mod vector;

pub use extractor::{compute, FeatureExtractor, EPSILON};
pub use profile::{project_all, Profile};
pub use vector::{FeatureVector, FEATURE_NAMES, NUM_FEATURES};
