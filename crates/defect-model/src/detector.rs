use std::{cmp::Ordering, convert::TryFrom, path::Path};

use tch::{CModule, Device, Tensor};
use tracing::{debug, info};
use video_io::Frame;

use crate::{DefectClass, Detect, Detection, DetectionResult, ModelError};

/// Threshold applied when the caller does not override it.
pub const DEFAULT_CONFIDENCE: f32 = 0.25;

const IOU_THRESHOLD: f32 = 0.45;
const MAX_DETECTIONS: usize = 512;

/// TorchScript-backed detector wrapper.
pub struct Detector {
    module: CModule,
    device: Device,
    confidence_threshold: f32,
}

impl Detector {
    /// Load a TorchScript module onto the requested device.
    pub fn load<P: AsRef<Path>>(model_path: P, device: Device) -> Result<Self, ModelError> {
        let path = model_path.as_ref();
        if !path.exists() {
            return Err(ModelError::WeightsMissing {
                path: path.display().to_string(),
            });
        }
        let module = CModule::load_on_device(path, device).map_err(|err| ModelError::Load {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        info!(model = %path.display(), device = ?device, "loaded detection model");
        Ok(Self {
            module,
            device,
            confidence_threshold: DEFAULT_CONFIDENCE,
        })
    }

    /// Override the confidence threshold used for filtering detections.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    /// Convert a BGR frame into a normalized RGB CHW tensor on the detector's
    /// device.
    fn frame_to_tensor(&self, frame: &Frame) -> Result<Tensor, ModelError> {
        let expected = Frame::buffer_len(frame.width, frame.height);
        if frame.data.len() != expected {
            return Err(ModelError::Inference {
                reason: format!(
                    "unexpected frame buffer size: got {} bytes, expected {expected}",
                    frame.data.len()
                ),
            });
        }

        let planes = bgr_to_rgb_planes(&frame.data, frame.width as usize, frame.height as usize);
        let tensor = Tensor::from_slice(&planes)
            .view([1, 3, frame.height as i64, frame.width as i64])
            .to_device(self.device);
        Ok(tensor)
    }
}

impl Detect for Detector {
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult, ModelError> {
        let input = self.frame_to_tensor(frame)?;
        let output = self
            .module
            .forward_ts(&[input])
            .map_err(|err| ModelError::Inference {
                reason: err.to_string(),
            })?;

        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(ModelError::Inference {
                reason: format!("unexpected detector output shape: {shape:?}"),
            });
        }

        // Exports differ on whether predictions or channels come first; the
        // channel axis is always the smaller one.
        let (channels, channels_first) = if shape[1] <= shape[2] {
            (shape[1], true)
        } else {
            (shape[2], false)
        };
        if channels < 5 {
            return Err(ModelError::Inference {
                reason: format!(
                    "detector output requires at least 5 channels (x,y,w,h,score), got {channels}"
                ),
            });
        }

        let preds = if channels_first {
            output
                .to_device(Device::Cpu)
                .squeeze_dim(0)
                .permute([1, 0])
                .contiguous()
        } else {
            output.to_device(Device::Cpu).squeeze_dim(0).contiguous()
        };
        let rows =
            Vec::<Vec<f32>>::try_from(&preds).map_err(|err| ModelError::Inference {
                reason: err.to_string(),
            })?;

        let result = parse_rows(&rows, self.confidence_threshold, frame.width, frame.height);
        debug!(
            detections = result.len(),
            threshold = self.confidence_threshold,
            "inference complete"
        );
        Ok(result)
    }
}

/// Split packed BGR bytes into normalized RGB planes (CHW order).
fn bgr_to_rgb_planes(data: &[u8], width: usize, height: usize) -> Vec<f32> {
    let area = width * height;
    let mut planes = vec![0f32; area * 3];
    for (i, px) in data.chunks_exact(3).take(area).enumerate() {
        planes[i] = f32::from(px[2]) / 255.0;
        planes[area + i] = f32::from(px[1]) / 255.0;
        planes[2 * area + i] = f32::from(px[0]) / 255.0;
    }
    planes
}

/// Turn raw prediction rows into filtered, clamped, deduplicated detections.
///
/// Rows carry `(cx, cy, w, h)` followed by either a single score, a score and
/// class id pair, or one score per class. Unknown class ids are dropped.
fn parse_rows(rows: &[Vec<f32>], threshold: f32, width: i32, height: i32) -> DetectionResult {
    let mut detections = Vec::new();
    for row in rows {
        if row.len() < 5 {
            continue;
        }
        let (score, class_id) = match row.len() {
            5 => (row[4], 0i64),
            6 => (row[4], row[5] as i64),
            _ => {
                let mut best = 0usize;
                let mut best_score = f32::MIN;
                for (idx, value) in row[4..].iter().enumerate() {
                    if *value > best_score {
                        best = idx;
                        best_score = *value;
                    }
                }
                (best_score, best as i64)
            }
        };
        if score < threshold {
            continue;
        }
        let class = match DefectClass::from_id(class_id) {
            Some(class) => class,
            None => continue,
        };
        let bbox = match corner_box(row[0], row[1], row[2], row[3], width, height) {
            Some(bbox) => bbox,
            None => continue,
        };
        detections.push(Detection {
            class,
            confidence: score,
            bbox,
        });
        if detections.len() >= MAX_DETECTIONS {
            break;
        }
    }

    non_max_suppression(&mut detections, IOU_THRESHOLD);
    DetectionResult { detections }
}

/// Convert a centered `(cx, cy, w, h)` box into frame-clamped pixel corners.
fn corner_box(cx: f32, cy: f32, w: f32, h: f32, width: i32, height: i32) -> Option<[f32; 4]> {
    let max_x = (width - 1).max(0) as f32;
    let max_y = (height - 1).max(0) as f32;
    let left = (cx - w / 2.0).clamp(0.0, max_x);
    let top = (cy - h / 2.0).clamp(0.0, max_y);
    let right = (cx + w / 2.0).clamp(0.0, max_x);
    let bottom = (cy + h / 2.0).clamp(0.0, max_y);
    if right <= left || bottom <= top {
        return None;
    }
    Some([left, top, right, bottom])
}

/// Greedy per-class suppression of overlapping boxes, highest confidence wins.
fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections.drain(..) {
        let suppressed = keep
            .iter()
            .any(|kept| kept.class == det.class && iou(&kept.bbox, &det.bbox) > iou_threshold);
        if !suppressed {
            keep.push(det);
        }
    }
    *detections = keep;
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}
