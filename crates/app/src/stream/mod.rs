//! Road-video defect analysis: decode, detect, annotate, write, preview.
//!
//! The module is split into focused submodules:
//! - `config`: CLI flag parsing and run settings.
//! - `pipeline`: orchestrates the read → detect → annotate → write loop.
//! - `cache`: single-slot reuse of detections between inference points.
//! - `inference`: detector worker thread and its request/reply handle.
//! - `annotate`: drawing primitives and JPEG packet encoding.
//! - `display`: where preview frames go; a shared slot in production.
//! - `server`: Actix Web preview endpoints.
//! - `data`: shared structs and the run status board.
//! - `telemetry`: logging and Prometheus recorder setup.

pub(crate) mod annotate;
pub(crate) mod cache;
pub(crate) mod config;
pub(crate) mod data;
pub(crate) mod display;
pub(crate) mod inference;
pub(crate) mod pipeline;
pub(crate) mod server;
pub(crate) mod telemetry;
