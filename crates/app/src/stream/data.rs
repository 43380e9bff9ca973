//! State shared between the frame loop, the preview server, and the CLI.

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
    },
};

use defect_model::DetectionResult;
use serde::Serialize;

/// Annotated frame packaged for the live preview.
#[derive(Clone)]
pub(crate) struct FramePacket {
    pub(crate) jpeg: Vec<u8>,
    pub(crate) detections: Vec<DetectionSummary>,
    pub(crate) timestamp_ms: i64,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
}

#[derive(Clone, Serialize)]
pub(crate) struct DetectionSummary {
    pub(crate) class: String,
    pub(crate) score: f32,
    pub(crate) bbox: [f32; 4],
}

pub(crate) fn summarize(result: &DetectionResult) -> Vec<DetectionSummary> {
    result
        .detections
        .iter()
        .map(|det| DetectionSummary {
            class: det.class.label().to_string(),
            score: det.confidence,
            bbox: det.bbox,
        })
        .collect()
}

/// Last-write-wins slot holding the most recent display packet.
pub(crate) type SharedFrame = Arc<Mutex<Option<FramePacket>>>;

/// Path of the finished artifact, set once a run exposes one.
pub(crate) type ArtifactSlot = Arc<Mutex<Option<PathBuf>>>;

/// Cooperative cancellation flag, settable from any thread and read once per
/// loop iteration.
#[derive(Clone, Default)]
pub(crate) struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lifecycle of one processing run. Terminal states have no outgoing
/// transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub(crate) fn label(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Cancelled => "cancelled",
            RunState::Failed => "failed",
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RunState::Idle => 0,
            RunState::Running => 1,
            RunState::Completed => 2,
            RunState::Cancelled => 3,
            RunState::Failed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunState::Running,
            2 => RunState::Completed,
            3 => RunState::Cancelled,
            4 => RunState::Failed,
            _ => RunState::Idle,
        }
    }
}

/// Atomics-backed progress board. The loop writes, the preview server
/// snapshots; nothing ever blocks on it.
#[derive(Default)]
pub(crate) struct RunStatus {
    state: AtomicU8,
    frames_read: AtomicU64,
    frames_written: AtomicU64,
    inference_runs: AtomicU64,
    frames_displayed: AtomicU64,
    total_frames: AtomicU64,
    fps_bits: AtomicU32,
}

impl RunStatus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_state(&self, state: RunState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Zero means the container did not report a frame count.
    pub(crate) fn set_total_frames(&self, total: Option<u64>) {
        self.total_frames.store(total.unwrap_or(0), Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_inference(&self) {
        self.inference_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_displayed(&self) {
        self.frames_displayed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_fps(&self, fps: f32) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatusSnapshot {
        let total = self.total_frames.load(Ordering::Relaxed);
        StatusSnapshot {
            state: self.state().label(),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            total_frames: (total > 0).then_some(total),
            inference_runs: self.inference_runs.load(Ordering::Relaxed),
            frames_displayed: self.frames_displayed.load(Ordering::Relaxed),
            fps: f32::from_bits(self.fps_bits.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time view of a [`RunStatus`].
#[derive(Clone, Serialize)]
pub(crate) struct StatusSnapshot {
    pub(crate) state: &'static str,
    pub(crate) frames_read: u64,
    pub(crate) frames_written: u64,
    pub(crate) total_frames: Option<u64>,
    pub(crate) inference_runs: u64,
    pub(crate) frames_displayed: u64,
    pub(crate) fps: f32,
}
