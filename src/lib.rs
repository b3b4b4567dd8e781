//! flowsight: per-flow feature extraction and streaming pipeline
//!
//! # Architecture
//! ```text
//! ┌──────────────┐  features   ┌──────────────┐  predictions  ┌──────────────┐
//! │ capture      │────────────▶│ inference    │──────────────▶│ supervisor   │
//! │ stage        │◀────────────│ stage (hub)  │               │ relay ──▶ UI │
//! └──────────────┘   control   └──────────────┘               └──────────────┘
//! ```
//!
//! - [`flow`]: bounded per-flow state table
//! - [`features`]: feature vectors and classifier profiles
//! - [`engine`]: capture thread, flow worker, capture stage process
//! - [`link`]: framed TCP pub/sub between stages
//! - [`inference`]: hub, classifier seam, `/predict`
//! - [`supervisor`]: stage processes, relay, operator HTTP surface

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod features;
pub mod flow;
pub mod inference;
pub mod link;
pub mod supervisor;

pub use config::Config;
pub use error::{CaptureError, ConfigError, FeatureComputeError, InferenceError, SupervisionError, TransportError};
