//! Post-processing of final-layer predictions into detections.
//!
//! Two decoders:
//! - NMS-free top-k: the `(query, class)` score grid is flattened and the
//!   `num_top_queries` best entries are kept, so one query may yield
//!   several detections with different classes
//! - NMS: each query keeps its best class, then greedy per-class
//!   suppression removes overlapping boxes
//!
//! Both return at most `num_top_queries` detections per image, sorted by
//! descending score, in pixels of the original image.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use candle_core::{DType, Tensor, D};
use candle_nn::ops::{sigmoid, softmax_last_dim};
use rayon::prelude::*;

use crate::box_ops;
use crate::coco_classes;
use crate::config::{PostProcessorConfig, RtDetrConfig};
use crate::detection::Detection;
use crate::error::{DetrError, Result};
use crate::target::ImageSize;

/// One scored `(query, class)` candidate before denormalization.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    query: usize,
    label: usize,
    score: f32,
}

/// Descending score, then ascending `(query, label)`.
fn by_score(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.query.cmp(&b.query))
        .then(a.label.cmp(&b.label))
}

#[derive(Debug, Clone)]
pub struct PostProcessor {
    num_classes: usize,
    num_top_queries: usize,
    score_threshold: f32,
    use_focal_loss: bool,
    use_nms: bool,
    nms_iou_threshold: f32,
    remap_mscoco_category: bool,
}

impl PostProcessor {
    pub fn new(config: &PostProcessorConfig, num_classes: usize) -> Result<Self> {
        if config.remap_mscoco_category && num_classes > coco_classes::CATEGORIES.len() {
            return Err(DetrError::config(format!(
                "remap_mscoco_category needs at most {} classes, got {}",
                coco_classes::CATEGORIES.len(),
                num_classes
            )));
        }
        if config.num_top_queries == 0 {
            return Err(DetrError::config("num_top_queries must be positive"));
        }
        Ok(Self {
            num_classes,
            num_top_queries: config.num_top_queries,
            score_threshold: config.score_threshold,
            use_focal_loss: config.use_focal_loss,
            use_nms: config.use_nms,
            nms_iou_threshold: config.nms_iou_threshold,
            remap_mscoco_category: config.remap_mscoco_category,
        })
    }

    pub fn from_config(config: &RtDetrConfig) -> Result<Self> {
        Self::new(&config.model.postprocessor, config.num_classes())
    }

    /// Maximum number of detections returned per image.
    pub fn max_detections(&self) -> usize {
        self.num_top_queries
    }

    /// Decode `logits [B, Q, C]` and normalized center/size `boxes [B, Q, 4]`.
    ///
    /// `sizes` holds the original size of each image. Returns one detection
    /// list per image; lists may be empty.
    pub fn forward(
        &self,
        logits: &Tensor,
        boxes: &Tensor,
        sizes: &[ImageSize],
    ) -> Result<Vec<Vec<Detection>>> {
        let (bs, num_queries, channels) = logits.dims3()?;
        let expected = if self.use_focal_loss {
            self.num_classes
        } else {
            self.num_classes + 1
        };
        if channels != expected {
            return Err(DetrError::shape(format!(
                "logits have {} channels, expected {}",
                channels, expected
            )));
        }
        if boxes.dims() != [bs, num_queries, 4] || sizes.len() != bs {
            return Err(DetrError::shape(format!(
                "boxes {:?} and {} image sizes do not fit logits {:?}",
                boxes.dims(),
                sizes.len(),
                logits.dims()
            )));
        }

        let logits = logits.detach().to_dtype(DType::F32)?;
        let scores = if self.use_focal_loss {
            sigmoid(&logits)?
        } else {
            softmax_last_dim(&logits)?.narrow(D::Minus1, 0, self.num_classes)?
        };
        let scores = scores.to_vec3::<f32>()?;
        let boxes = boxes.detach().to_dtype(DType::F32)?.to_vec3::<f32>()?;

        Ok(scores
            .par_iter()
            .zip(boxes.par_iter())
            .zip(sizes.par_iter())
            .map(|((scores, boxes), &size)| self.decode_image(scores, boxes, size))
            .collect())
    }

    fn decode_image(
        &self,
        scores: &[Vec<f32>],
        boxes: &[Vec<f32>],
        size: ImageSize,
    ) -> Vec<Detection> {
        let kept = if self.use_nms {
            self.select_nms(scores, boxes)
        } else if self.use_focal_loss {
            self.select_topk(scores)
        } else {
            self.select_best_class(scores)
        };

        kept.into_iter()
            .filter(|c| c.score >= self.score_threshold)
            .map(|c| {
                let b = &boxes[c.query];
                let cxcywh = [b[0], b[1], b[2], b[3]];
                Detection::from_normalized(cxcywh, size, c.score, self.class_id(c.label))
            })
            .collect()
    }

    fn class_id(&self, label: usize) -> usize {
        if self.remap_mscoco_category {
            coco_classes::category_id(label).unwrap_or(label)
        } else {
            label
        }
    }

    /// Top-k over the flattened `(query, class)` grid.
    fn select_topk(&self, scores: &[Vec<f32>]) -> Vec<Candidate> {
        let mut all: Vec<Candidate> = scores
            .iter()
            .enumerate()
            .flat_map(|(query, row)| {
                row.iter()
                    .enumerate()
                    .map(move |(label, &score)| Candidate { query, label, score })
            })
            .collect();
        top_k(&mut all, self.num_top_queries);
        all
    }

    /// Best class per query, then top-k over queries.
    fn select_best_class(&self, scores: &[Vec<f32>]) -> Vec<Candidate> {
        let mut all: Vec<Candidate> = scores.iter().enumerate().filter_map(best_class).collect();
        top_k(&mut all, self.num_top_queries);
        all
    }

    /// Best class per query, greedy suppression within each class.
    fn select_nms(&self, scores: &[Vec<f32>], boxes: &[Vec<f32>]) -> Vec<Candidate> {
        let mut per_class: BTreeMap<usize, Vec<Candidate>> = BTreeMap::new();
        for c in scores.iter().enumerate().filter_map(best_class) {
            per_class.entry(c.label).or_default().push(c);
        }

        let corners = |q: usize| {
            let b = &boxes[q];
            box_ops::to_corners([b[0], b[1], b[2], b[3]])
        };

        let mut kept = Vec::new();
        for candidates in per_class.values_mut() {
            candidates.sort_by(by_score);
            let mut class_kept: Vec<Candidate> = Vec::new();
            for c in candidates.iter() {
                let suppressed = class_kept.iter().any(|k| {
                    box_ops::iou(corners(k.query), corners(c.query)) > self.nms_iou_threshold
                });
                if !suppressed {
                    class_kept.push(*c);
                }
            }
            kept.extend(class_kept);
        }
        top_k(&mut kept, self.num_top_queries);
        kept
    }
}

fn best_class((query, row): (usize, &Vec<f32>)) -> Option<Candidate> {
    row.iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(&a.0)))
        .map(|(label, &score)| Candidate { query, label, score })
}

/// Keep the `k` best candidates, sorted.
fn top_k(candidates: &mut Vec<Candidate>, k: usize) {
    if candidates.len() > k {
        candidates.select_nth_unstable_by(k, by_score);
        candidates.truncate(k);
    }
    candidates.sort_by(by_score);
}
