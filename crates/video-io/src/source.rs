use std::path::Path;

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::types::{CaptureError, Frame};

/// Frame rate assumed when a container reports none.
pub const FALLBACK_FPS: f64 = 30.0;

/// Geometry and timing reported by a video container at open time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceMetadata {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    /// Total frames when the container reports a count, `None` otherwise.
    pub frame_count: Option<u64>,
}

/// Sequential access to the frames of one video.
///
/// Implementations are pull-based and non-restartable: each call to
/// [`FrameSource::next_frame`] consumes one frame, and `Ok(None)` marks the
/// end of the stream for good.
pub trait FrameSource {
    fn metadata(&self) -> SourceMetadata;
    /// Read the next frame, scaled to `target` (width, height).
    fn next_frame(&mut self, target: (i32, i32)) -> Result<Option<Frame>, CaptureError>;
    /// Close the underlying handle. Reads after release report end of stream.
    fn release(&mut self);
}

/// File-backed frame source reading through OpenCV's `VideoCapture`.
pub struct VideoSource {
    cap: VideoCapture,
    meta: SourceMetadata,
    decoded: Mat,
    scratch: Mat,
    open: bool,
}

impl VideoSource {
    /// Open a video file and gather its metadata.
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let display = path.display().to_string();
        let cap = open_video_capture(&display)?;
        let meta = read_metadata(&cap, &display)?;
        debug!(
            source = %display,
            width = meta.width,
            height = meta.height,
            fps = meta.fps,
            frames = meta.frame_count,
            "opened video source"
        );
        Ok(Self {
            cap,
            meta,
            decoded: Mat::default(),
            scratch: Mat::default(),
            open: true,
        })
    }
}

impl FrameSource for VideoSource {
    fn metadata(&self) -> SourceMetadata {
        self.meta
    }

    fn next_frame(&mut self, target: (i32, i32)) -> Result<Option<Frame>, CaptureError> {
        if !self.open {
            return Ok(None);
        }

        let grabbed = match self.cap.read(&mut self.decoded) {
            Ok(grabbed) => grabbed,
            Err(err) => {
                // A decoder fault mid-stream truncates the run rather than failing it.
                warn!("decode error, treating as end of stream: {err}");
                false
            }
        };
        if !grabbed {
            return Ok(None);
        }

        let size = self
            .decoded
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            return Ok(None);
        }

        let (target_w, target_h) = target;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.decoded,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &self.scratch
        } else {
            &self.decoded
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(Some(Frame {
            data,
            width: target_w,
            height: target_h,
            timestamp_ms: Utc::now().timestamp_millis(),
        }))
    }

    fn release(&mut self) {
        if !self.open {
            return;
        }
        if let Err(err) = self.cap.release() {
            warn!("failed to release video source: {err}");
        }
        self.open = false;
    }
}

fn open_video_capture(path: &str) -> Result<VideoCapture, CaptureError> {
    for backend in [videoio::CAP_FFMPEG, videoio::CAP_ANY] {
        match VideoCapture::from_file(path, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                debug!("backend {backend} failed to open {path}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        path: path.to_string(),
    })
}

fn read_metadata(cap: &VideoCapture, path: &str) -> Result<SourceMetadata, CaptureError> {
    let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as i32;
    let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as i32;
    if width <= 0 || height <= 0 {
        return Err(CaptureError::Open {
            path: path.to_string(),
        });
    }

    let fps = normalize_fps(cap.get(videoio::CAP_PROP_FPS).unwrap_or(0.0));
    let raw_count = cap.get(videoio::CAP_PROP_FRAME_COUNT).unwrap_or(0.0);
    let frame_count = if raw_count.is_finite() && raw_count >= 1.0 {
        Some(raw_count as u64)
    } else {
        None
    };

    Ok(SourceMetadata {
        width,
        height,
        fps,
        frame_count,
    })
}

/// Replace a missing or nonsensical container frame rate with [`FALLBACK_FPS`].
pub fn normalize_fps(reported: f64) -> f64 {
    if reported.is_finite() && reported > 0.0 {
        reported
    } else {
        FALLBACK_FPS
    }
}

/// Derive the processing resolution from the source geometry and a width budget.
///
/// Height preserves the source aspect ratio. Both dimensions are forced even
/// because several mp4 encoders reject odd sizes.
pub fn scaled_size(meta: &SourceMetadata, target_width: i32) -> (i32, i32) {
    let width = target_width.max(2) & !1;
    let height = ((width as f64) * (meta.height as f64) / (meta.width as f64)).round() as i32;
    let height = (height & !1).max(2);
    (width, height)
}
