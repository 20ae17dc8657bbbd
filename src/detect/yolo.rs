//! YOLOv5 output decoding.

use anyhow::{anyhow, Result};

use super::result::RawDetection;
use crate::geometry::BoundingBox;

/// Columns before the per-class scores in a YOLOv5 output row:
/// `cx, cy, w, h, objectness`.
const ROW_PREFIX: usize = 5;

/// Turn a `[1, N, 5 + C]` output tensor into frame-space detections.
///
/// Rows are `cx, cy, w, h, objectness, scores...` in model-input pixels. The
/// class is the argmax of the scores and its score is the confidence. Rows
/// whose best score is non-finite or at most `confidence_floor` are dropped.
/// Boxes are scaled by `frame / input_size` per axis, converted to top-left
/// corner form and truncated to whole pixels.
pub fn decode_rows(
    output: &[f32],
    shape: &[usize],
    input_size: u32,
    frame: (u32, u32),
    confidence_floor: f32,
) -> Result<Vec<RawDetection>> {
    let &[1, rows, cols] = shape else {
        return Err(anyhow!("unexpected model output shape {:?}", shape));
    };
    if cols <= ROW_PREFIX {
        return Err(anyhow!("model output rows carry no class scores: {:?}", shape));
    }
    if output.len() != rows * cols {
        return Err(anyhow!(
            "model output holds {} values, shape {:?} needs {}",
            output.len(),
            shape,
            rows * cols
        ));
    }

    let sx = frame.0 as f32 / input_size as f32;
    let sy = frame.1 as f32 / input_size as f32;

    let mut detections = Vec::new();
    for row in output.chunks_exact(cols) {
        let Some((class_id, &confidence)) = row[ROW_PREFIX..]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            continue;
        };
        if !confidence.is_finite() || confidence <= confidence_floor {
            continue;
        }
        let w = row[2] * sx;
        let h = row[3] * sy;
        let x = row[0] * sx - w / 2.0;
        let y = row[1] * sy - h / 2.0;
        detections.push(RawDetection::new(
            class_id as u32,
            confidence,
            BoundingBox::new(x.trunc(), y.trunc(), w.trunc(), h.trunc()),
        ));
    }
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cx: f32, cy: f32, w: f32, h: f32, scores: &[f32]) -> Vec<f32> {
        let mut row = vec![cx, cy, w, h, 0.9];
        row.extend_from_slice(scores);
        row
    }

    #[test]
    fn picks_best_class_and_rescales_box_to_frame() {
        let output = row(101.0, 101.0, 41.0, 41.0, &[0.2, 0.7, 0.5]);
        // 960x480 frame through a 640 input: sx = 1.5, sy = 0.75
        let detections = decode_rows(&output, &[1, 1, 8], 640, (960, 480), 0.1).unwrap();

        assert_eq!(detections.len(), 1);
        let det = detections[0];
        assert_eq!(det.class_id, 1);
        assert_eq!(det.confidence, 0.7);
        // x = 151.5 - 30.75, y = 75.75 - 15.375, w = 61.5, h = 30.75, all truncated
        assert_eq!(det.bbox, BoundingBox::new(120.0, 60.0, 61.0, 30.0));
    }

    #[test]
    fn weak_and_non_finite_rows_are_dropped() {
        let mut output = row(50.0, 50.0, 10.0, 10.0, &[0.25, 0.1]);
        output.extend(row(50.0, 50.0, 10.0, 10.0, &[f32::NAN, 0.9]));
        output.extend(row(320.0, 320.0, 64.0, 32.0, &[0.1, 0.3]));

        let detections = decode_rows(&output, &[1, 3, 7], 640, (640, 640), 0.25).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, 1);
        assert_eq!(detections[0].bbox, BoundingBox::new(288.0, 304.0, 64.0, 32.0));
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let output = row(1.0, 1.0, 1.0, 1.0, &[0.5]);
        assert!(decode_rows(&output, &[1, 6], 640, (640, 640), 0.1).is_err());
        assert!(decode_rows(&output, &[2, 1, 6], 640, (640, 640), 0.1).is_err());
        assert!(decode_rows(&output[..5], &[1, 1, 5], 640, (640, 640), 0.1).is_err());
        assert!(decode_rows(&output, &[1, 2, 6], 640, (640, 640), 0.1).is_err());
    }
}
