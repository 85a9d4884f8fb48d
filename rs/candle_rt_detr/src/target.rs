//! Ground-truth annotations as handed over by the data loader.

use serde::{Deserialize, Serialize};

use crate::error::{DetrError, Result};

/// One annotated object: class label and normalized `[cx, cy, w, h]` box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthObject {
    pub label: usize,
    pub bbox: [f32; 4],
}

impl GroundTruthObject {
    pub fn new(label: usize, bbox: [f32; 4]) -> Self {
        Self { label, bbox }
    }
}

/// Size of the original image, used to denormalize predictions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// All annotations of one image.
///
/// `image_id` identifies the sample independently of its batch position; the
/// denoising generator seeds its per-image noise stream from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageTargets {
    pub image_id: u64,
    #[serde(default)]
    pub objects: Vec<GroundTruthObject>,
}

impl ImageTargets {
    pub fn new(image_id: u64, objects: Vec<GroundTruthObject>) -> Self {
        Self { image_id, objects }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn labels(&self) -> Vec<u32> {
        self.objects.iter().map(|o| o.label as u32).collect()
    }

    /// Reject labels outside `[0, num_classes)`.
    pub fn validate(&self, num_classes: usize) -> Result<()> {
        for (i, obj) in self.objects.iter().enumerate() {
            if obj.label >= num_classes {
                return Err(DetrError::shape(format!(
                    "image {} object {} has label {} but num_classes is {}",
                    self.image_id, i, obj.label, num_classes
                )));
            }
        }
        Ok(())
    }
}

/// Total number of objects across a batch.
pub fn total_objects(targets: &[ImageTargets]) -> usize {
    targets.iter().map(ImageTargets::len).sum()
}
