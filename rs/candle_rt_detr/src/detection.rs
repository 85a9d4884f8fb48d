//! Detections handed to the evaluator: pixel-space corner boxes in the frame
//! of the original image.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::box_ops::to_corners;
use crate::target::ImageSize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `[x1, y1, x2, y2]` in pixels
    pub bbox: [f32; 4],
    pub score: f32,
    /// Contiguous label, or the COCO category id when remapping is on
    pub class_id: usize,
}

impl Detection {
    pub fn new(bbox: [f32; 4], score: f32, class_id: usize) -> Self {
        Self {
            bbox,
            score,
            class_id,
        }
    }

    /// Scale a normalized center/size box to `size`.
    pub fn from_normalized(
        cxcywh: [f32; 4],
        size: ImageSize,
        score: f32,
        class_id: usize,
    ) -> Self {
        let scale = [size.width as f32, size.height as f32];
        let corners = to_corners(cxcywh);
        let bbox = std::array::from_fn(|i| corners[i] * scale[i % 2]);
        Self::new(bbox, score, class_id)
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x1, y1, x2, y2] = self.bbox;
        write!(
            f,
            "class {:>3} score {:.3} box ({:.1}, {:.1}, {:.1}, {:.1})",
            self.class_id, self.score, x1, y1, x2, y2
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let det = Detection::new([10.0, 20.0, 110.0, 170.0], 0.9, 1);
        assert_eq!(
            det.to_string(),
            "class   1 score 0.900 box (10.0, 20.0, 110.0, 170.0)"
        );
    }

    #[test]
    fn test_denormalize() {
        let size = ImageSize::new(640, 480);
        let det = Detection::from_normalized([0.5, 0.5, 0.5, 0.25], size, 0.8, 3);
        assert_eq!(det.bbox, [160.0, 180.0, 480.0, 300.0]);
    }

    #[test]
    fn test_json_shape() {
        let det = Detection::new([1.0, 2.0, 3.0, 4.0], 0.5, 7);
        let json = serde_json::to_value(det).unwrap();
        assert_eq!(json["class_id"], 7);
        assert_eq!(json["bbox"][2], 3.0);
    }
}
