use std::path::{Path, PathBuf};

use opencv::{core, prelude::*, videoio};
use tracing::debug;

use crate::types::{Frame, SinkError};

/// Append-only consumer of processed frames.
pub trait FrameSink {
    fn write_bgr(&mut self, frame: &Frame) -> Result<(), SinkError>;
    /// Flush and close the container. Idempotent.
    fn finish(&mut self) -> Result<(), SinkError>;
    /// Close the container and throw away whatever was written so far.
    fn discard(&mut self);
    fn frames_written(&self) -> u64;
}

/// mp4 writer backed by OpenCV's `VideoWriter`.
///
/// Every [`FrameSink::write_bgr`] call appends exactly one frame, so the
/// output carries as many frames as were pushed regardless of how often
/// inference ran upstream.
pub struct VideoSink {
    writer: videoio::VideoWriter,
    path: PathBuf,
    size: (i32, i32),
    frames_written: u64,
    open: bool,
}

impl VideoSink {
    /// Create an mp4v container at `path` with the given frame rate and geometry.
    pub fn create(path: &Path, fps: f64, size: (i32, i32)) -> Result<Self, SinkError> {
        let display = path.display().to_string();
        let fourcc = videoio::VideoWriter::fourcc('m', 'p', '4', 'v').map_err(|err| {
            debug!("fourcc setup failed: {err}");
            SinkError::Create {
                path: display.clone(),
            }
        })?;
        let writer = videoio::VideoWriter::new(
            &display,
            fourcc,
            fps,
            core::Size {
                width: size.0,
                height: size.1,
            },
            true,
        )
        .map_err(|err| {
            debug!("writer construction failed: {err}");
            SinkError::Create {
                path: display.clone(),
            }
        })?;
        if !writer.is_opened().unwrap_or(false) {
            return Err(SinkError::Create { path: display });
        }

        debug!(
            output = %path.display(),
            fps,
            width = size.0,
            height = size.1,
            "created output container"
        );
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            size,
            frames_written: 0,
            open: true,
        })
    }
}

impl FrameSink for VideoSink {
    fn write_bgr(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if !self.open {
            return Err(SinkError::Closed);
        }
        let expected = Frame::buffer_len(self.size.0, self.size.1);
        if frame.data.len() != expected || (frame.width, frame.height) != self.size {
            return Err(SinkError::Geometry {
                expected,
                actual: frame.data.len(),
            });
        }

        let mat = Mat::from_slice(&frame.data)
            .and_then(|flat| flat.reshape(3, frame.height)?.try_clone())
            .map_err(|err| SinkError::Write {
                reason: err.to_string(),
            })?;
        self.writer.write(&mat).map_err(|err| SinkError::Write {
            reason: err.to_string(),
        })?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.writer.release().map_err(|err| SinkError::Write {
            reason: err.to_string(),
        })?;
        Ok(())
    }

    fn discard(&mut self) {
        if self.open {
            self.open = false;
            if let Err(err) = self.writer.release() {
                debug!("writer release during discard failed: {err}");
            }
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!(
                "could not remove partial output {}: {err}",
                self.path.display()
            );
        }
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }
}
