//! Box overlap math.

use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel space: top-left corner plus width/height.
///
/// Serialized as `[x, y, w, h]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn x2(&self) -> f32 {
        self.x + self.w
    }

    pub fn y2(&self) -> f32 {
        self.y + self.h
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x, b.y, b.w, b.h]
    }
}

/// Intersection over union of two boxes, in `[0, 1]`.
///
/// Returns 0 when the union is empty (zero-area boxes) instead of dividing by zero.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let ix = (a.x2().min(b.x2()) - a.x.max(b.x)).max(0.0);
    let iy = (a.y2().min(b.y2()) - a.y.max(b.y)).max(0.0);
    let intersection = ix * iy;
    let union = a.area() + b.area() - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_boxes_overlap_fully() {
        let b = BoundingBox::new(10.0, 20.0, 30.0, 40.0);
        assert!((iou(&b, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn disjoint_boxes_have_zero_iou() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 10.0, 10.0);
        assert_eq!(iou(&a, &b), 0.0);

        // touching edges share no area
        let c = BoundingBox::new(10.0, 0.0, 10.0, 10.0);
        assert_eq!(iou(&a, &c), 0.0);
    }

    #[test]
    fn iou_is_symmetric() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 5.0, 10.0, 10.0);
        assert_eq!(iou(&a, &b), iou(&b, &a));
        // 25 / (100 + 100 - 25)
        assert!((iou(&a, &b) - 25.0 / 175.0).abs() < 1e-6);
    }

    #[test]
    fn degenerate_boxes_do_not_divide_by_zero() {
        let a = BoundingBox::new(5.0, 5.0, 0.0, 0.0);
        assert_eq!(iou(&a, &a), 0.0);
    }

    #[test]
    fn serializes_as_array() {
        let b = BoundingBox::new(1.0, 2.0, 3.0, 4.0);
        assert_eq!(serde_json::to_string(&b).unwrap(), "[1.0,2.0,3.0,4.0]");
        let back: BoundingBox = serde_json::from_str("[1,2,3,4]").unwrap();
        assert_eq!(back, b);
    }
}
