use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::Result;
use tracing::{debug, warn};

use crate::stream::config::{StreamConfig, USAGE};
use crate::stream::data::{ArtifactSlot, CancelFlag, RunStatus, SharedFrame};
use crate::stream::display::SharedFrameSink;
use crate::stream::inference::{DetectorSpec, InferenceHandle};
use crate::stream::pipeline::{self, RunOutcome};
use crate::stream::server::spawn_preview_server;
use crate::stream::telemetry;
use defect_model::{
    preload_cuda_runtime,
    tch::{Cuda, Device},
};

pub(crate) fn run(args: &[String]) -> Result<()> {
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        println!("{USAGE}");
        return Ok(());
    }

    let config = StreamConfig::from_args(args)?;
    telemetry::init_logging(config.verbose);
    let _ = telemetry::init_metrics_recorder();

    let cancel = CancelFlag::new();
    let handler_cancel = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_cancel.set()) {
        warn!("Failed to install Ctrl+C handler: {err}");
    }

    let device = if config.use_cpu {
        Device::Cpu
    } else {
        if !preload_cuda_runtime() {
            debug!("no CUDA runtime library could be loaded; expecting CPU inference");
        }
        Device::cuda_if_available()
    };
    debug!(
        "CUDA available: {} (devices: {})",
        Cuda::is_available(),
        Cuda::device_count()
    );

    let detector = InferenceHandle::spawn(
        DetectorSpec {
            weights: config.weights_path(),
            device,
            confidence: config.confidence,
        },
        config.inference_timeout,
    )?;
    debug!("{}", detector.description());
    println!("{}", detector.description());

    let latest: SharedFrame = Arc::new(Mutex::new(None));
    let status = Arc::new(RunStatus::new());
    let artifact: ArtifactSlot = Arc::new(Mutex::new(None));

    let server = if config.preview {
        match spawn_preview_server(config.port, latest.clone(), status.clone(), artifact.clone()) {
            Ok(server) => {
                debug!("HTTP preview available at http://127.0.0.1:{}/", config.port);
                println!("HTTP preview available at http://127.0.0.1:{}/", config.port);
                Some(server)
            }
            Err(err) => {
                warn!("Preview server unavailable: {err}");
                None
            }
        }
    } else {
        None
    };

    let mut display = SharedFrameSink::new(latest.clone());
    let result = pipeline::run(&config, &detector, &mut display, &status, &cancel);

    if let Ok(report) = &result {
        if report.artifact.is_some() {
            if let Ok(mut slot) = artifact.lock() {
                *slot = report.artifact.clone();
            }
        }
        let output = report
            .artifact
            .as_deref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "none".to_string());
        let message = match report.outcome {
            RunOutcome::Completed => format!(
                "Analysis complete: {} frames in {:.1}s ({} inference passes). Output: {output}",
                report.frames_written,
                report.elapsed.as_secs_f32(),
                report.inference_runs
            ),
            RunOutcome::Cancelled => format!(
                "Stopped by user after {} frames. Partial output: {output}",
                report.frames_written
            ),
        };
        debug!("{message}");
        println!("{message}");
    }

    if let Some(server) = server {
        if result.is_ok() {
            cancel.clear();
            debug!("Preview still serving; press Ctrl+C to exit");
            println!("Preview still serving; press Ctrl+C to exit");
            while !cancel.is_set() {
                thread::sleep(Duration::from_millis(200));
            }
        }
        server.stop();
    }

    result?;
    Ok(())
}
