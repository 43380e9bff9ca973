//! TorchScript-backed road defect detection.
//!
//! The crate is split into focused submodules:
//! - `classes`: defect categories and pretrained weight variants.
//! - `detector`: tch `CModule` wrapper with output postprocessing.
//! - `runtime`: CUDA runtime preloading for GPU inference.
//! - `types`: detection data model and the [`Detect`] seam.

pub use classes::{DefectClass, ModelVariant};
pub use detector::{DEFAULT_CONFIDENCE, Detector};
pub use runtime::preload_cuda_runtime;
pub use types::{Detect, Detection, DetectionResult};

/// Re-exported so downstream crates can name devices without depending on
/// `tch` directly.
pub use tch;

mod classes;
mod detector;
mod runtime;
mod types;

use thiserror::Error;

/// Failure taxonomy for model loading and inference.
///
/// Load failures are fatal at startup: no run can begin until the weights
/// resolve. Inference failures abort the run they occur in; callers must not
/// paper over them with an empty result.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model weights not found at {path:?}")]
    WeightsMissing { path: String },
    #[error("failed to load model weights {path:?}: {reason}")]
    Load { path: String, reason: String },
    #[error("inference failed: {reason}")]
    Inference { reason: String },
}
