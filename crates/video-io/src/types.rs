use thiserror::Error;

/// Raw BGR frame read from a video source.
///
/// Pixels are tightly packed, three bytes per pixel, row-major. Frames are
/// copied out of the decoder's scratch buffer so downstream stages own their
/// data outright.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
}

impl Frame {
    /// Number of bytes a BGR frame of the given geometry occupies.
    pub fn buffer_len(width: i32, height: i32) -> usize {
        (width.max(0) as usize) * (height.max(0) as usize) * 3
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {path:?}")]
    Open { path: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to create output container {path:?}")]
    Create { path: String },
    #[error("failed to write frame: {reason}")]
    Write { reason: String },
    #[error("frame is {actual} bytes but the container expects {expected}")]
    Geometry { expected: usize, actual: usize },
    #[error("output container already finished")]
    Closed,
}
