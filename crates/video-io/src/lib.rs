//! Video container I/O for the road defect pipeline.
//!
//! The crate is split into focused submodules:
//! - `source`: pull-based frame reader over OpenCV `VideoCapture`.
//! - `sink`: mp4 frame writer over OpenCV `VideoWriter`.
//! - `types`: frame buffer and error types shared by both ends.

pub use sink::{FrameSink, VideoSink};
pub use source::{
    FALLBACK_FPS, FrameSource, SourceMetadata, VideoSource, normalize_fps, scaled_size,
};
pub use types::{CaptureError, Frame, SinkError};

mod sink;
mod source;
mod types;
