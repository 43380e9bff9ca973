use anyhow::{Result, anyhow};
use image::{ImageBuffer, Rgb, codecs::jpeg::JpegEncoder};

use crate::stream::data::{FramePacket, summarize};
use defect_model::{DefectClass, DetectionResult};
use video_io::Frame;

const JPEG_QUALITY: u8 = 85;

/// Draw detection boxes and labels straight into the BGR frame buffer.
///
/// Output pixels depend only on the input pixels and the detections, never
/// on wall-clock state, so re-running a frame reproduces identical bytes.
pub(crate) fn annotate(frame: &mut Frame, result: &DetectionResult) {
    let width = frame.width;
    let height = frame.height;
    if width <= 0 || height <= 0 {
        return;
    }

    for det in &result.detections {
        let color = class_color(det.class);
        draw_rectangle(
            &mut frame.data,
            width,
            height,
            det.bbox[0].round() as i32,
            det.bbox[1].round() as i32,
            det.bbox[2].round() as i32,
            det.bbox[3].round() as i32,
            color,
        );
    }

    for det in &result.detections {
        let color = class_color(det.class);
        let label = format!("{} {:.0}%", det.class.label(), det.confidence * 100.0);
        let label_x = det.bbox[0].round() as i32;
        let label_y = (det.bbox[1].round() as i32 - 12).max(0);
        let text_width = label.chars().count() as i32 * 6;
        fill_rect(
            &mut frame.data,
            width,
            height,
            label_x,
            label_y,
            label_x + text_width,
            label_y + 8,
            [0, 0, 0],
        );
        draw_label(&mut frame.data, width, height, label_x, label_y, &label, color);
    }
}

/// Box colors in BGR order, one per defect class.
pub(crate) fn class_color(class: DefectClass) -> [u8; 3] {
    match class {
        DefectClass::Crack => [0, 255, 255],
        DefectClass::Pothole => [0, 0, 255],
        DefectClass::SpeedBump => [0, 255, 0],
    }
}

/// Compress an annotated frame to JPEG and bundle it for the preview feed.
pub(crate) fn encode_packet(
    frame: &Frame,
    result: &DetectionResult,
    frame_number: u64,
    fps: f32,
) -> Result<FramePacket> {
    let rgb = bgr_to_rgb(&frame.data);
    let image =
        ImageBuffer::<Rgb<u8>, Vec<u8>>::from_vec(frame.width as u32, frame.height as u32, rgb)
            .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
        .encode_image(&image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;

    Ok(FramePacket {
        jpeg: buffer,
        detections: summarize(result),
        timestamp_ms: frame.timestamp_ms,
        frame_number,
        fps,
    })
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}

fn put_pixel(data: &mut [u8], width: i32, height: i32, x: i32, y: i32, color: [u8; 3]) {
    if x < 0 || y < 0 || x >= width || y >= height {
        return;
    }
    let offset = ((y * width + x) * 3) as usize;
    if let Some(pixel) = data.get_mut(offset..offset + 3) {
        pixel.copy_from_slice(&color);
    }
}

#[allow(clippy::too_many_arguments)]
fn draw_rectangle(
    data: &mut [u8],
    width: i32,
    height: i32,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: [u8; 3],
) {
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for x in left..=right {
        put_pixel(data, width, height, x, top, color);
        put_pixel(data, width, height, x, bottom, color);
    }
    for y in top..=bottom {
        put_pixel(data, width, height, left, y, color);
        put_pixel(data, width, height, right, y, color);
    }
}

#[allow(clippy::too_many_arguments)]
fn fill_rect(
    data: &mut [u8],
    width: i32,
    height: i32,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: [u8; 3],
) {
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for y in top..=bottom {
        for x in left..=right {
            put_pixel(data, width, height, x, y, color);
        }
    }
}

fn draw_label(
    data: &mut [u8],
    width: i32,
    height: i32,
    mut x: i32,
    y: i32,
    text: &str,
    color: [u8; 3],
) {
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        put_pixel(data, width, height, x + col, py, color);
                    }
                }
            }
        }
        x += 6;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([
            0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001,
        ]),
        'B' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110,
        ]),
        'C' => Some([
            0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110,
        ]),
        'D' => Some([
            0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110,
        ]),
        'E' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'H' => Some([
            0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001,
        ]),
        'K' => Some([
            0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001,
        ]),
        'L' => Some([
            0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'M' => Some([
            0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001,
        ]),
        'O' => Some([
            0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110,
        ]),
        'P' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000,
        ]),
        'R' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001,
        ]),
        'S' => Some([
            0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        'T' => Some([
            0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100,
        ]),
        'U' => Some([
            0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110,
        ]),
        '0' => Some([
            0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110,
        ]),
        '1' => Some([
            0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110,
        ]),
        '2' => Some([
            0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111,
        ]),
        '3' => Some([
            0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110,
        ]),
        '4' => Some([
            0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010,
        ]),
        '5' => Some([
            0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        '6' => Some([
            0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110,
        ]),
        '7' => Some([
            0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000,
        ]),
        '8' => Some([
            0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110,
        ]),
        '9' => Some([
            0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100,
        ]),
        '%' => Some([
            0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000,
        ]),
        ' ' => Some([0, 0, 0, 0, 0, 0, 0]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use defect_model::Detection;

    use super::*;

    fn test_frame(width: i32, height: i32) -> Frame {
        Frame {
            data: vec![40u8; (width * height * 3) as usize],
            width,
            height,
            timestamp_ms: 0,
        }
    }

    fn detection(class: DefectClass, bbox: [f32; 4]) -> Detection {
        Detection {
            class,
            confidence: 0.9,
            bbox,
        }
    }

    fn pixel(frame: &Frame, x: i32, y: i32) -> [u8; 3] {
        let offset = ((y * frame.width + x) * 3) as usize;
        [
            frame.data[offset],
            frame.data[offset + 1],
            frame.data[offset + 2],
        ]
    }

    #[test]
    fn test_annotation_is_deterministic() {
        let result = DetectionResult {
            detections: vec![
                detection(DefectClass::Pothole, [10.0, 30.0, 40.0, 50.0]),
                detection(DefectClass::Crack, [5.0, 20.0, 25.0, 44.0]),
            ],
        };
        let mut first = test_frame(64, 64);
        let mut second = test_frame(64, 64);

        annotate(&mut first, &result);
        annotate(&mut second, &result);

        assert_eq!(first.data, second.data);
    }

    #[test]
    fn test_box_edges_use_the_class_color() {
        let result = DetectionResult {
            detections: vec![detection(DefectClass::Pothole, [10.0, 30.0, 40.0, 50.0])],
        };
        let mut frame = test_frame(64, 64);
        annotate(&mut frame, &result);

        assert_eq!(pixel(&frame, 10, 30), [0, 0, 255]);
        assert_eq!(pixel(&frame, 40, 50), [0, 0, 255]);
        assert_eq!(pixel(&frame, 25, 40), [40, 40, 40]);
    }

    #[test]
    fn test_empty_result_leaves_pixels_untouched() {
        let mut frame = test_frame(16, 12);
        let before = frame.data.clone();
        annotate(&mut frame, &DetectionResult::default());
        assert_eq!(frame.data, before);
    }

    #[test]
    fn test_out_of_bounds_boxes_are_clamped() {
        let result = DetectionResult {
            detections: vec![detection(DefectClass::SpeedBump, [-8.0, -20.0, 200.0, 300.0])],
        };
        let mut frame = test_frame(16, 12);
        annotate(&mut frame, &result);
        assert_eq!(frame.data.len(), 16 * 12 * 3);
    }

    #[test]
    fn test_every_label_character_has_a_glyph() {
        let mut vocabulary = String::from("0123456789% ");
        for class in DefectClass::ALL {
            vocabulary.push_str(&class.label().to_uppercase());
        }
        for ch in vocabulary.chars() {
            assert!(glyph_bits(ch).is_some(), "missing glyph for {ch:?}");
        }
    }

    #[test]
    fn test_encode_packet_produces_jpeg() {
        let result = DetectionResult {
            detections: vec![detection(DefectClass::Crack, [2.0, 2.0, 10.0, 8.0])],
        };
        let frame = test_frame(32, 24);
        let packet = encode_packet(&frame, &result, 7, 24.5).unwrap();

        assert_eq!(&packet.jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(packet.frame_number, 7);
        assert_eq!(packet.fps, 24.5);
        assert_eq!(packet.detections.len(), 1);
        assert_eq!(packet.detections[0].class, "crack");
    }
}
