use video_io::Frame;

use crate::{DefectClass, ModelError};

/// Single localized defect.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class: DefectClass,
    /// Confidence in `[0, 1]`, at or above the configured threshold.
    pub confidence: f32,
    /// Pixel corners (left, top, right, bottom), clamped to the frame bounds.
    pub bbox: [f32; 4],
}

/// Everything the detector found in one frame, ordered by confidence.
///
/// Results are immutable once produced and may be reused across several
/// consecutive frames while frame skipping is in effect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

/// Opaque detection capability: one frame in, one result out.
///
/// Implementations may be arbitrarily slow; callers own pacing and timeouts.
pub trait Detect {
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult, ModelError>;
}
