//! The frame loop: read, detect or reuse, annotate, write, maybe preview.

use std::{
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::stream::annotate::{annotate, encode_packet};
use crate::stream::cache::InferenceCache;
use crate::stream::config::StreamConfig;
use crate::stream::data::{CancelFlag, RunState, RunStatus};
use crate::stream::display::DisplaySink;
use crate::stream::inference::InferenceHandle;
use defect_model::ModelError;
use video_io::{
    CaptureError, FrameSink, FrameSource, SinkError, VideoSink, VideoSource, scaled_size,
};

/// Short pause after publishing a preview frame so a viewer can follow along.
const DISPLAY_PAUSE: Duration = Duration::from_millis(15);
const HEARTBEAT_INTERVAL: u64 = 30;

#[derive(Debug, Error)]
pub(crate) enum StreamError {
    #[error(transparent)]
    Source(#[from] CaptureError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    Cancelled,
}

/// What a finished run produced. `artifact` is the playable output, present
/// only when at least one frame made it into the container.
#[derive(Debug)]
pub(crate) struct RunReport {
    pub(crate) outcome: RunOutcome,
    pub(crate) frames_read: u64,
    pub(crate) frames_written: u64,
    pub(crate) inference_runs: u64,
    pub(crate) frames_displayed: u64,
    pub(crate) elapsed: Duration,
    pub(crate) artifact: Option<PathBuf>,
}

pub(crate) fn run(
    config: &StreamConfig,
    detector: &InferenceHandle,
    display: &mut dyn DisplaySink,
    status: &RunStatus,
    cancel: &CancelFlag,
) -> Result<RunReport, StreamError> {
    status.set_state(RunState::Running);
    let (source, sink, target) = match open_containers(config) {
        Ok(parts) => parts,
        Err(err) => {
            status.set_state(RunState::Failed);
            return Err(err);
        }
    };
    process_stream(
        source, sink, target, config, detector, display, status, cancel,
    )
}

fn open_containers(
    config: &StreamConfig,
) -> Result<(VideoSource, VideoSink, (i32, i32)), StreamError> {
    let mut source = VideoSource::open(&config.video)?;
    let meta = source.metadata();
    let target = scaled_size(&meta, config.width);
    debug!(
        input = %config.video.display(),
        fps = meta.fps,
        frames = ?meta.frame_count,
        width = target.0,
        height = target.1,
        "opened input video"
    );
    let sink = match VideoSink::create(&config.output, meta.fps, target) {
        Ok(sink) => sink,
        Err(err) => {
            source.release();
            return Err(err.into());
        }
    };
    Ok((source, sink, target))
}

/// Drive frames from `source` into `sink` until the stream ends, an error
/// aborts the run or the cancel flag is observed.
///
/// The flag is sampled once per iteration before the next read, so at most
/// the frame already in flight lands in the output after a cancel request.
/// Whatever happens, the source is released and the sink is closed before
/// this returns; failed runs discard their partial output.
#[allow(clippy::too_many_arguments)]
fn process_stream<S, K>(
    mut source: S,
    mut sink: K,
    target: (i32, i32),
    config: &StreamConfig,
    detector: &InferenceHandle,
    display: &mut dyn DisplaySink,
    status: &RunStatus,
    cancel: &CancelFlag,
) -> Result<RunReport, StreamError>
where
    S: FrameSource,
    K: FrameSink,
{
    let meta = source.metadata();
    status.set_total_frames(meta.frame_count);

    let mut cache = InferenceCache::default();
    let started = Instant::now();
    let mut last_frame_at = Instant::now();
    let mut smoothed_fps = 0.0_f32;
    let mut index: u64 = 0;
    let mut inference_runs: u64 = 0;
    let mut displayed: u64 = 0;
    let mut cancelled = false;

    let result = loop {
        if cancel.is_set() {
            cancelled = true;
            debug!("cancellation observed at frame #{index}");
            break Ok(());
        }

        let mut frame = match source.next_frame(target) {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(err) => break Err(StreamError::Source(err)),
        };
        index += 1;
        status.record_read();
        metrics::counter!("roadscan_frames_read_total").increment(1);

        let detections = if cache.needs_inference(index, config.skip_interval) {
            let inference_started = Instant::now();
            match detector.detect(&frame) {
                Ok(fresh) => {
                    inference_runs += 1;
                    status.record_inference();
                    metrics::counter!("roadscan_inference_total").increment(1);
                    metrics::histogram!("roadscan_stage_latency_seconds", "stage" => "inference")
                        .record(inference_started.elapsed().as_secs_f64());
                    cache.store(fresh)
                }
                Err(err) => break Err(StreamError::Model(err)),
            }
        } else if let Some(cached) = cache.last() {
            cached
        } else {
            break Err(StreamError::Model(ModelError::Inference {
                reason: "no cached detections to reuse".to_string(),
            }));
        };

        annotate(&mut frame, detections);

        let write_started = Instant::now();
        if let Err(err) = sink.write_bgr(&frame) {
            break Err(StreamError::Sink(err));
        }
        status.record_written();
        metrics::counter!("roadscan_frames_written_total").increment(1);
        metrics::histogram!("roadscan_stage_latency_seconds", "stage" => "write")
            .record(write_started.elapsed().as_secs_f64());

        let frame_interval = last_frame_at.elapsed();
        last_frame_at = Instant::now();
        let instant_fps = if frame_interval.as_secs_f32() > 0.0 {
            1.0 / frame_interval.as_secs_f32()
        } else {
            0.0
        };
        smoothed_fps = if smoothed_fps == 0.0 {
            instant_fps
        } else {
            0.9 * smoothed_fps + 0.1 * instant_fps
        };
        status.set_fps(smoothed_fps);
        metrics::gauge!("roadscan_pipeline_fps").set(smoothed_fps as f64);
        metrics::histogram!("roadscan_frame_interval_seconds").record(frame_interval.as_secs_f64());

        if index % u64::from(config.display_interval.max(1)) == 0 {
            match encode_packet(&frame, detections, index, smoothed_fps) {
                Ok(packet) => {
                    display.publish(packet);
                    displayed += 1;
                    status.record_displayed();
                    metrics::counter!("roadscan_frames_displayed_total").increment(1);
                    thread::sleep(DISPLAY_PAUSE);
                }
                Err(err) => warn!("Preview encode failed for frame #{index}: {err}"),
            }
        }

        if index % HEARTBEAT_INTERVAL == 0 {
            match meta.frame_count {
                Some(total) => debug!(
                    "processed {index}/{total} frames ({inference_runs} inference passes, {smoothed_fps:.1} fps)"
                ),
                None => debug!(
                    "processed {index} frames ({inference_runs} inference passes, {smoothed_fps:.1} fps)"
                ),
            }
        }
    };

    source.release();
    let frames_written = sink.frames_written();

    match result {
        Ok(()) => match sink.finish() {
            Ok(()) => {
                let artifact = if frames_written > 0 {
                    Some(config.output.clone())
                } else {
                    sink.discard();
                    None
                };
                let outcome = if cancelled {
                    RunOutcome::Cancelled
                } else {
                    RunOutcome::Completed
                };
                status.set_state(match outcome {
                    RunOutcome::Cancelled => RunState::Cancelled,
                    RunOutcome::Completed => RunState::Completed,
                });
                Ok(RunReport {
                    outcome,
                    frames_read: index,
                    frames_written,
                    inference_runs,
                    frames_displayed: displayed,
                    elapsed: started.elapsed(),
                    artifact,
                })
            }
            Err(err) => {
                sink.discard();
                status.set_state(RunState::Failed);
                Err(StreamError::Sink(err))
            }
        },
        Err(err) => {
            sink.discard();
            status.set_state(RunState::Failed);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use defect_model::{Detect, DefectClass, Detection, DetectionResult};
    use video_io::{Frame, SourceMetadata};

    use crate::stream::data::FramePacket;

    use super::*;

    struct ScriptedSource {
        meta: SourceMetadata,
        produced: u64,
        limit: u64,
        open: Arc<AtomicBool>,
        cancel_after: Option<(u64, CancelFlag)>,
    }

    impl ScriptedSource {
        fn new(limit: u64, frame_count: Option<u64>) -> (Self, Arc<AtomicBool>) {
            let open = Arc::new(AtomicBool::new(true));
            (
                Self {
                    meta: SourceMetadata {
                        width: 8,
                        height: 6,
                        fps: 30.0,
                        frame_count,
                    },
                    produced: 0,
                    limit,
                    open: open.clone(),
                    cancel_after: None,
                },
                open,
            )
        }

        fn cancel_after(mut self, frame: u64, flag: CancelFlag) -> Self {
            self.cancel_after = Some((frame, flag));
            self
        }
    }

    impl FrameSource for ScriptedSource {
        fn metadata(&self) -> SourceMetadata {
            self.meta
        }

        fn next_frame(&mut self, target: (i32, i32)) -> Result<Option<Frame>, CaptureError> {
            if self.produced >= self.limit {
                return Ok(None);
            }
            self.produced += 1;
            if let Some((frame, flag)) = &self.cancel_after {
                if self.produced >= *frame {
                    flag.set();
                }
            }
            Ok(Some(Frame {
                data: vec![0u8; (target.0 * target.1 * 3) as usize],
                width: target.0,
                height: target.1,
                timestamp_ms: self.produced as i64,
            }))
        }

        fn release(&mut self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct SinkState {
        written: Vec<i64>,
        open: bool,
        discarded: bool,
        fail_on: Option<u64>,
    }

    struct RecordingSink {
        state: Arc<Mutex<SinkState>>,
    }

    impl RecordingSink {
        fn new() -> (Self, Arc<Mutex<SinkState>>) {
            let state = Arc::new(Mutex::new(SinkState {
                open: true,
                ..Default::default()
            }));
            (
                Self {
                    state: state.clone(),
                },
                state,
            )
        }

        fn failing_on(write: u64) -> (Self, Arc<Mutex<SinkState>>) {
            let (sink, state) = Self::new();
            state.lock().unwrap().fail_on = Some(write);
            (sink, state)
        }
    }

    impl FrameSink for RecordingSink {
        fn write_bgr(&mut self, frame: &Frame) -> Result<(), SinkError> {
            let mut state = self.state.lock().unwrap();
            if !state.open {
                return Err(SinkError::Closed);
            }
            let next = state.written.len() as u64 + 1;
            if state.fail_on == Some(next) {
                return Err(SinkError::Write {
                    reason: "scripted failure".to_string(),
                });
            }
            state.written.push(frame.timestamp_ms);
            Ok(())
        }

        fn finish(&mut self) -> Result<(), SinkError> {
            self.state.lock().unwrap().open = false;
            Ok(())
        }

        fn discard(&mut self) {
            let mut state = self.state.lock().unwrap();
            state.open = false;
            state.discarded = true;
        }

        fn frames_written(&self) -> u64 {
            self.state.lock().unwrap().written.len() as u64
        }
    }

    struct FakeDetector {
        calls: Arc<Mutex<Vec<i64>>>,
        fail_on_frame: Option<i64>,
        cancel_on_frame: Option<(i64, CancelFlag)>,
    }

    impl Detect for FakeDetector {
        fn detect(&mut self, frame: &Frame) -> Result<DetectionResult, ModelError> {
            let ts = frame.timestamp_ms;
            self.calls.lock().unwrap().push(ts);
            if self.fail_on_frame == Some(ts) {
                return Err(ModelError::Inference {
                    reason: "scripted failure".to_string(),
                });
            }
            if let Some((frame_no, flag)) = &self.cancel_on_frame {
                if ts >= *frame_no {
                    flag.set();
                }
            }
            Ok(DetectionResult {
                detections: vec![Detection {
                    class: DefectClass::Crack,
                    confidence: 0.9,
                    bbox: [ts as f32, 1.0, 4.0, 4.0],
                }],
            })
        }
    }

    #[derive(Default)]
    struct CountingDisplay {
        published: Vec<(u64, f32)>,
    }

    impl DisplaySink for CountingDisplay {
        fn publish(&mut self, packet: FramePacket) {
            let marker = packet
                .detections
                .first()
                .map(|det| det.bbox[0])
                .unwrap_or(-1.0);
            self.published.push((packet.frame_number, marker));
        }
    }

    fn test_config(skip: u32, display: u32) -> StreamConfig {
        StreamConfig {
            video: PathBuf::from("input.mp4"),
            variant: Default::default(),
            weights: None,
            weights_dir: PathBuf::from("weights"),
            confidence: 0.35,
            skip_interval: skip,
            display_interval: display,
            width: 640,
            output: PathBuf::from("annotated.mp4"),
            use_cpu: true,
            preview: false,
            port: 8080,
            verbose: false,
            inference_timeout: Duration::from_secs(5),
        }
    }

    fn detector_with(fake: FakeDetector) -> InferenceHandle {
        InferenceHandle::from_backend(Box::new(fake), Duration::from_secs(5))
    }

    fn plain_detector() -> (InferenceHandle, Arc<Mutex<Vec<i64>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let fake = FakeDetector {
            calls: calls.clone(),
            fail_on_frame: None,
            cancel_on_frame: None,
        };
        (detector_with(fake), calls)
    }

    #[test]
    fn test_inference_follows_the_skip_schedule() {
        let (source, source_open) = ScriptedSource::new(30, Some(30));
        let (sink, sink_state) = RecordingSink::new();
        let (detector, calls) = plain_detector();
        let mut display = CountingDisplay::default();
        let status = RunStatus::new();
        let cancel = CancelFlag::default();
        let config = test_config(5, 3);

        let report = process_stream(
            source,
            sink,
            (8, 6),
            &config,
            &detector,
            &mut display,
            &status,
            &cancel,
        )
        .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.frames_read, 30);
        assert_eq!(report.frames_written, 30);
        assert_eq!(report.inference_runs, 7);
        assert_eq!(*calls.lock().unwrap(), vec![1, 5, 10, 15, 20, 25, 30]);

        let displayed: Vec<u64> = display.published.iter().map(|(n, _)| *n).collect();
        assert_eq!(displayed, (1..=10).map(|n| n * 3).collect::<Vec<u64>>());
        assert_eq!(report.frames_displayed, 10);

        assert!(!source_open.load(Ordering::SeqCst));
        let state = sink_state.lock().unwrap();
        assert_eq!(state.written.len(), 30);
        assert!(!state.open);
        assert!(!state.discarded);
        assert_eq!(report.artifact, Some(PathBuf::from("annotated.mp4")));
        assert_eq!(status.snapshot().state, "completed");
    }

    #[test]
    fn test_skip_of_one_runs_inference_every_frame() {
        let (source, _) = ScriptedSource::new(6, Some(6));
        let (sink, _) = RecordingSink::new();
        let (detector, calls) = plain_detector();
        let mut display = CountingDisplay::default();
        let status = RunStatus::new();

        let report = process_stream(
            source,
            sink,
            (8, 6),
            &test_config(1, 2),
            &detector,
            &mut display,
            &status,
            &CancelFlag::default(),
        )
        .unwrap();

        assert_eq!(report.inference_runs, 6);
        assert_eq!(*calls.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_skipped_frames_reuse_the_cached_result() {
        let (source, _) = ScriptedSource::new(6, Some(6));
        let (sink, _) = RecordingSink::new();
        let (detector, calls) = plain_detector();
        let mut display = CountingDisplay::default();
        let status = RunStatus::new();

        process_stream(
            source,
            sink,
            (8, 6),
            &test_config(3, 1),
            &detector,
            &mut display,
            &status,
            &CancelFlag::default(),
        )
        .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![1, 3, 6]);
        let markers: Vec<f32> = display.published.iter().map(|(_, m)| *m).collect();
        assert_eq!(markers, vec![1.0, 1.0, 3.0, 3.0, 3.0, 6.0]);
    }

    #[test]
    fn test_detection_failure_aborts_and_discards_the_artifact() {
        let (source, source_open) = ScriptedSource::new(50, Some(50));
        let (sink, sink_state) = RecordingSink::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let detector = detector_with(FakeDetector {
            calls: calls.clone(),
            fail_on_frame: Some(12),
            cancel_on_frame: None,
        });
        let mut display = CountingDisplay::default();
        let status = RunStatus::new();

        let err = process_stream(
            source,
            sink,
            (8, 6),
            &test_config(1, 3),
            &detector,
            &mut display,
            &status,
            &CancelFlag::default(),
        )
        .unwrap_err();

        assert!(matches!(err, StreamError::Model(_)));
        let state = sink_state.lock().unwrap();
        assert_eq!(state.written.len(), 11);
        assert!(state.discarded);
        assert!(!source_open.load(Ordering::SeqCst));
        assert_eq!(status.snapshot().state, "failed");
    }

    #[test]
    fn test_cancellation_stops_within_one_frame_and_keeps_partial_output() {
        let cancel = CancelFlag::default();
        let (source, source_open) = ScriptedSource::new(100, Some(100));
        let source = source.cancel_after(20, cancel.clone());
        let (sink, sink_state) = RecordingSink::new();
        let (detector, _) = plain_detector();
        let mut display = CountingDisplay::default();
        let status = RunStatus::new();

        let report = process_stream(
            source,
            sink,
            (8, 6),
            &test_config(5, 3),
            &detector,
            &mut display,
            &status,
            &cancel,
        )
        .unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.frames_read, 20);
        assert_eq!(report.frames_written, 20);
        assert_eq!(report.artifact, Some(PathBuf::from("annotated.mp4")));
        let state = sink_state.lock().unwrap();
        assert!(!state.discarded);
        assert!(!state.open);
        assert!(!source_open.load(Ordering::SeqCst));
        assert_eq!(status.snapshot().state, "cancelled");
    }

    #[test]
    fn test_cancel_during_inference_writes_at_most_one_more_frame() {
        let cancel = CancelFlag::default();
        let (source, _) = ScriptedSource::new(100, Some(100));
        let (sink, sink_state) = RecordingSink::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let detector = detector_with(FakeDetector {
            calls: calls.clone(),
            fail_on_frame: None,
            cancel_on_frame: Some((20, cancel.clone())),
        });
        let mut display = CountingDisplay::default();
        let status = RunStatus::new();

        let report = process_stream(
            source,
            sink,
            (8, 6),
            &test_config(1, 50),
            &detector,
            &mut display,
            &status,
            &cancel,
        )
        .unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.frames_written, 20);
        assert_eq!(sink_state.lock().unwrap().written.len(), 20);
    }

    #[test]
    fn test_sink_failure_aborts_and_discards() {
        let (source, _) = ScriptedSource::new(10, Some(10));
        let (sink, sink_state) = RecordingSink::failing_on(3);
        let (detector, _) = plain_detector();
        let mut display = CountingDisplay::default();
        let status = RunStatus::new();

        let err = process_stream(
            source,
            sink,
            (8, 6),
            &test_config(1, 3),
            &detector,
            &mut display,
            &status,
            &CancelFlag::default(),
        )
        .unwrap_err();

        assert!(matches!(err, StreamError::Sink(_)));
        let state = sink_state.lock().unwrap();
        assert_eq!(state.written.len(), 2);
        assert!(state.discarded);
        assert_eq!(status.snapshot().state, "failed");
    }

    #[test]
    fn test_empty_source_completes_without_an_artifact() {
        let (source, _) = ScriptedSource::new(0, Some(0));
        let (sink, sink_state) = RecordingSink::new();
        let (detector, calls) = plain_detector();
        let mut display = CountingDisplay::default();
        let status = RunStatus::new();

        let report = process_stream(
            source,
            sink,
            (8, 6),
            &test_config(5, 3),
            &detector,
            &mut display,
            &status,
            &CancelFlag::default(),
        )
        .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.frames_written, 0);
        assert_eq!(report.artifact, None);
        assert!(calls.lock().unwrap().is_empty());
        assert!(sink_state.lock().unwrap().discarded);
    }

    #[test]
    fn test_status_board_tracks_the_run() {
        let (source, _) = ScriptedSource::new(9, Some(9));
        let (sink, _) = RecordingSink::new();
        let (detector, _) = plain_detector();
        let mut display = CountingDisplay::default();
        let status = RunStatus::new();

        process_stream(
            source,
            sink,
            (8, 6),
            &test_config(3, 3),
            &detector,
            &mut display,
            &status,
            &CancelFlag::default(),
        )
        .unwrap();

        let snapshot = status.snapshot();
        assert_eq!(snapshot.frames_read, 9);
        assert_eq!(snapshot.frames_written, 9);
        assert_eq!(snapshot.inference_runs, 4);
        assert_eq!(snapshot.frames_displayed, 3);
        assert_eq!(snapshot.total_frames, Some(9));
    }
}
