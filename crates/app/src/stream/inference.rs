//! Inference worker thread and its request/reply handle.
//!
//! The libtorch module lives on a dedicated thread. Requests cross a bounded
//! channel one frame at a time, so every reply pairs with the request that
//! produced it and a wedged forward pass can be timed out instead of joined.

use std::{path::PathBuf, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::stream::telemetry;
use defect_model::{Detect, DetectionResult, Detector, ModelError, tch::Device};
use video_io::Frame;

/// How long the worker gets to load weights before startup is declared dead.
const INIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything needed to bring up a detector on the worker thread.
pub(crate) struct DetectorSpec {
    pub(crate) weights: PathBuf,
    pub(crate) device: Device,
    pub(crate) confidence: f32,
}

pub(crate) struct InferenceHandle {
    request_tx: Sender<Frame>,
    reply_rx: Receiver<Result<DetectionResult, ModelError>>,
    timeout: Duration,
    description: String,
}

impl InferenceHandle {
    /// Spawn the worker and wait for it to report a loaded model.
    ///
    /// Load failures surface here as the worker's own `ModelError`, so the
    /// caller never starts a run against a detector that cannot serve.
    pub(crate) fn spawn(spec: DetectorSpec, timeout: Duration) -> Result<Self, ModelError> {
        let (init_tx, init_rx) = bounded::<Result<String, ModelError>>(1);
        let (request_tx, request_rx) = bounded::<Frame>(1);
        let (reply_tx, reply_rx) = bounded::<Result<DetectionResult, ModelError>>(1);

        let weights = spec.weights.display().to_string();
        telemetry::spawn_thread("roadscan-inference", move || {
            let mut backend = match Detector::load(&spec.weights, spec.device) {
                Ok(detector) => {
                    let detector = detector.with_confidence_threshold(spec.confidence);
                    let description = format!(
                        "defect detector on {:?} (confidence >= {:.2})",
                        detector.device(),
                        detector.confidence_threshold()
                    );
                    if init_tx.send(Ok(description)).is_err() {
                        return;
                    }
                    detector
                }
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };
            for frame in request_rx {
                if reply_tx.send(backend.detect(&frame)).is_err() {
                    break;
                }
            }
        })
        .map_err(|err| ModelError::Load {
            path: weights.clone(),
            reason: format!("failed to spawn inference thread: {err}"),
        })?;

        match init_rx.recv_timeout(INIT_TIMEOUT) {
            Ok(Ok(description)) => Ok(Self {
                request_tx,
                reply_rx,
                timeout,
                description,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ModelError::Load {
                path: weights,
                reason: format!("model did not come up within {INIT_TIMEOUT:?}"),
            }),
        }
    }

    /// Run one frame through the worker, blocking until the reply or the
    /// configured timeout. Either channel going dead means the worker died.
    pub(crate) fn detect(&self, frame: &Frame) -> Result<DetectionResult, ModelError> {
        if self.request_tx.send(frame.clone()).is_err() {
            return Err(ModelError::Inference {
                reason: "inference worker is gone".to_string(),
            });
        }
        match self.reply_rx.recv_timeout(self.timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => Err(ModelError::Inference {
                reason: format!("no detector reply within {:?}", self.timeout),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(ModelError::Inference {
                reason: "inference worker terminated unexpectedly".to_string(),
            }),
        }
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    /// Wire an arbitrary backend into a worker, skipping the load handshake.
    #[cfg(test)]
    pub(crate) fn from_backend(mut backend: Box<dyn Detect + Send>, timeout: Duration) -> Self {
        let (request_tx, request_rx) = bounded::<Frame>(1);
        let (reply_tx, reply_rx) = bounded(1);
        std::thread::spawn(move || {
            for frame in request_rx {
                if reply_tx.send(backend.detect(&frame)).is_err() {
                    break;
                }
            }
        });
        Self {
            request_tx,
            reply_rx,
            timeout,
            description: "test backend".to_string(),
        }
    }
}
