//! Actix Web preview server for the annotated feed.
//!
//! The server runs on a dedicated thread to keep the frame loop free from
//! Actix runtime concerns. It serves the latest JPEG, an MJPEG stream, run
//! status, Prometheus metrics and the finished output file.

use std::{sync::Arc, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result, bail};
use async_stream::stream;
use crossbeam_channel::bounded;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::error;

use crate::stream::data::{ArtifactSlot, DetectionSummary, FramePacket, RunStatus, SharedFrame};
use crate::stream::telemetry;

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) latest: SharedFrame,
    pub(crate) status: Arc<RunStatus>,
    pub(crate) artifact: ArtifactSlot,
}

#[derive(Default)]
/// Handle for the preview server thread.
pub(crate) struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PreviewServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Spawn the preview server thread and wait for it to bind.
///
/// A port that cannot be bound surfaces as an error here instead of a dead
/// thread, so the caller can carry on without a preview.
pub(crate) fn spawn_preview_server(
    port: u16,
    latest: SharedFrame,
    status: Arc<RunStatus>,
    artifact: ArtifactSlot,
) -> Result<PreviewServer> {
    let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("roadscan-preview-server".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let bound = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(ServerState {
                            latest: latest.clone(),
                            status: status.clone(),
                            artifact: artifact.clone(),
                        }))
                        .route("/", web::get().to(index_route))
                        .route("/frame.jpg", web::get().to(frame_handler))
                        .route("/stream.mjpg", web::get().to(stream_handler))
                        .route("/status", web::get().to(status_handler))
                        .route("/metrics", web::get().to(metrics_handler))
                        .route("/download", web::get().to(download_handler))
                })
                .bind(("0.0.0.0", port));

                let server = match bound {
                    Ok(bound) => bound.run(),
                    Err(err) => {
                        let _ = ready_tx.send(Err(format!("could not bind port {port}: {err}")));
                        return Ok(());
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("HTTP server error: {err}");
            }
        })
        .context("Failed to spawn preview server thread")?;

    match ready_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Ok(())) => Ok(PreviewServer {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }),
        Ok(Err(err)) => {
            let _ = handle.join();
            bail!(err)
        }
        Err(_) => bail!("preview server did not report readiness in time"),
    }
}

/// Fetch the latest encoded frame from the shared pointer.
fn latest_frame(shared: &SharedFrame) -> Option<FramePacket> {
    match shared.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    }
}

/// Serve the minimal viewer page.
async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

/// Return the most recent annotated frame as a single JPEG.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match latest_frame(&state.latest) {
        Some(packet) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .body(packet.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream the MJPEG feed over a multipart response.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(33));
        loop {
            interval.tick().await;
            let frame = state
                .latest
                .lock()
                .ok()
                .and_then(|guard| guard.clone());
            if let Some(packet) = frame {
                let mut payload = Vec::with_capacity(packet.jpeg.len() + 64);
                payload.extend_from_slice(b"--frame\r\n");
                payload.extend_from_slice(
                    format!("X-Sequence: {}\r\n", packet.frame_number).as_bytes(),
                );
                payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
                payload.extend_from_slice(&packet.jpeg);
                payload.extend_from_slice(b"\r\n");
                yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .insert_header((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

#[derive(Serialize)]
struct StatusResponse<'a> {
    state: &'static str,
    frames_read: u64,
    frames_written: u64,
    total_frames: Option<u64>,
    inference_runs: u64,
    frames_displayed: u64,
    fps: f32,
    detections: &'a [DetectionSummary],
}

/// Return run progress plus the most recent detections as JSON.
async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    let snapshot = state.status.snapshot();
    let guard = match state.latest.lock() {
        Ok(guard) => guard,
        Err(err) => return HttpResponse::InternalServerError().body(err.to_string()),
    };
    let detections = match *guard {
        Some(ref packet) => packet.detections.as_slice(),
        None => &[],
    };
    HttpResponse::Ok().json(StatusResponse {
        state: snapshot.state,
        frames_read: snapshot.frames_read,
        frames_written: snapshot.frames_written,
        total_frames: snapshot.total_frames,
        inference_runs: snapshot.inference_runs,
        frames_displayed: snapshot.frames_displayed,
        fps: snapshot.fps,
        detections,
    })
}

/// Expose the Prometheus registry in text format.
async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4; charset=utf-8")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder is not installed"),
    }
}

/// Serve the annotated video once a run has produced one.
async fn download_handler(state: web::Data<ServerState>) -> HttpResponse {
    let artifact = match state.artifact.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    };
    let path = match artifact {
        Some(path) => path,
        None => return HttpResponse::NotFound().body("no annotated video is available yet"),
    };
    match std::fs::read(&path) {
        Ok(bytes) => {
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "roadscan_output.mp4".to_string());
            HttpResponse::Ok()
                .content_type("video/mp4")
                .insert_header((
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{filename}\""),
                ))
                .body(bytes)
        }
        Err(err) => HttpResponse::InternalServerError()
            .body(format!("could not read {}: {err}", path.display())),
    }
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>roadscan</title>
<style>
  body { background: #111; color: #ddd; font-family: monospace; margin: 2rem; }
  img { max-width: 100%; border: 1px solid #333; }
  a { color: #8cf; }
</style>
</head>
<body>
<h1>roadscan</h1>
<p>Live annotated feed. The preview shows a sampled subset; every frame is
written to the output file.</p>
<img src="/stream.mjpg" alt="annotated road video">
<p><a href="/download">download output</a> | <a href="/status">status</a> | <a href="/metrics">metrics</a></p>
</body>
</html>
"#;
