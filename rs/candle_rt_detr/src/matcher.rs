//! Hungarian matcher
//!
//! Builds a query-by-ground-truth cost matrix per image from classification,
//! L1 box and GIoU terms, then solves it with [`linear_sum_assignment`].
//!
//! The cost is computed on detached copies of the predictions: the assignment
//! is a discrete decision and no gradient flows through it.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::{sigmoid, softmax_last_dim};
use log::debug;
use rayon::prelude::*;

use crate::assignment::{linear_sum_assignment, Assignment, CostMatrix};
use crate::box_ops::{box_cxcywh_to_xyxy, generalized_box_iou};
use crate::config::{MatcherConfig, RtDetrConfig};
use crate::error::{DetrError, Result};
use crate::target::ImageTargets;

/// Added inside the focal cost logarithms.
const LOG_EPS: f64 = 1e-8;

/// Optimal one-to-one matcher between decoder queries and ground truth.
#[derive(Debug, Clone)]
pub struct HungarianMatcher {
    cost_class: f64,
    cost_bbox: f64,
    cost_giou: f64,
    alpha: f64,
    gamma: f64,
    use_focal_loss: bool,
    num_classes: usize,
}

impl HungarianMatcher {
    pub fn new(config: &MatcherConfig, num_classes: usize) -> Self {
        Self {
            cost_class: config.cost_class,
            cost_bbox: config.cost_bbox,
            cost_giou: config.cost_giou,
            alpha: config.alpha,
            gamma: config.gamma,
            use_focal_loss: config.use_focal_loss,
            num_classes,
        }
    }

    pub fn from_config(config: &RtDetrConfig) -> Self {
        Self::new(&config.criterion.matcher, config.num_classes())
    }

    /// Width of the logits last dimension this matcher expects.
    ///
    /// Focal heads emit one channel per class; softmax heads add a trailing
    /// no-object channel.
    pub fn logit_channels(&self) -> usize {
        if self.use_focal_loss {
            self.num_classes
        } else {
            self.num_classes + 1
        }
    }

    fn check_shapes(
        &self,
        logits: &Tensor,
        boxes: &Tensor,
        targets: &[ImageTargets],
    ) -> Result<()> {
        let (b, q, c) = logits.dims3()?;
        let (bb, bq, four) = boxes.dims3()?;
        if c != self.logit_channels() {
            return Err(DetrError::shape(format!(
                "logits have {} channels, expected {} for {} classes",
                c,
                self.logit_channels(),
                self.num_classes
            )));
        }
        if (bb, bq, four) != (b, q, 4) {
            return Err(DetrError::shape(format!(
                "boxes {:?} do not line up with logits {:?}",
                boxes.dims(),
                logits.dims()
            )));
        }
        if targets.len() != b {
            return Err(DetrError::shape(format!(
                "{} target lists for a batch of {}",
                targets.len(),
                b
            )));
        }
        for t in targets {
            t.validate(self.num_classes)?;
        }
        Ok(())
    }

    /// Per-image cost matrices for predictions `logits [B, Q, C]`,
    /// `boxes [B, Q, 4]` (center/size, normalized).
    ///
    /// Images without objects get an empty matrix.
    pub fn cost_matrices(
        &self,
        logits: &Tensor,
        boxes: &Tensor,
        targets: &[ImageTargets],
    ) -> Result<Vec<CostMatrix>> {
        self.check_shapes(logits, boxes, targets)?;
        let (bs, num_queries, channels) = logits.dims3()?;

        let sizes: Vec<usize> = targets.iter().map(ImageTargets::len).collect();
        let total: usize = sizes.iter().sum();
        if total == 0 {
            return Ok(vec![CostMatrix::empty(num_queries); bs]);
        }

        let device = logits.device();
        let logits = logits
            .detach()
            .to_dtype(DType::F32)?
            .reshape((bs * num_queries, channels))?;
        let out_bbox = boxes
            .detach()
            .to_dtype(DType::F32)?
            .reshape((bs * num_queries, 4))?;

        let tgt_ids: Vec<u32> = targets.iter().flat_map(|t| t.labels()).collect();
        let tgt_ids = Tensor::new(tgt_ids.as_slice(), device)?;
        let tgt_bbox: Vec<f32> = targets
            .iter()
            .flat_map(|t| t.objects.iter().flat_map(|o| o.bbox))
            .collect();
        let tgt_bbox = Tensor::from_vec(tgt_bbox, (total, 4), device)?;

        // [B*Q, T], shifted per image so each column's minimum is zero
        let cost_class = self
            .class_cost(&logits, &tgt_ids)?
            .reshape((bs, num_queries, total))?;
        let cost_class = cost_class
            .broadcast_sub(&cost_class.min_keepdim(1)?)?
            .reshape((bs * num_queries, total))?;
        let cost_bbox = out_bbox
            .unsqueeze(1)?
            .broadcast_sub(&tgt_bbox.unsqueeze(0)?)?
            .abs()?
            .sum(D::Minus1)?;
        let cost_giou = generalized_box_iou(
            &box_cxcywh_to_xyxy(&out_bbox)?,
            &box_cxcywh_to_xyxy(&tgt_bbox)?,
        )?
        .affine(-1.0, 1.0)?;

        let cost = ((cost_bbox.affine(self.cost_bbox, 0.0)?
            + cost_class.affine(self.cost_class, 0.0)?)?
            + cost_giou.affine(self.cost_giou, 0.0)?)?;
        let cost = cost.reshape((bs, num_queries, total))?.to_vec3::<f32>()?;

        let mut matrices = Vec::with_capacity(bs);
        let mut offset = 0;
        for (image_cost, &g) in cost.iter().zip(sizes.iter()) {
            if g == 0 {
                matrices.push(CostMatrix::empty(num_queries));
                continue;
            }
            let data: Vec<f32> = image_cost
                .iter()
                .flat_map(|row| row[offset..offset + g].iter().copied())
                .collect();
            matrices.push(CostMatrix::new(num_queries, g, data)?);
            offset += g;
        }
        Ok(matrices)
    }

    /// Classification cost `[N, T]` for flattened logits `[N, C]`.
    fn class_cost(&self, logits: &Tensor, tgt_ids: &Tensor) -> Result<Tensor> {
        if self.use_focal_loss {
            let prob = sigmoid(logits)?.index_select(tgt_ids, 1)?;
            let one_minus = prob.affine(-1.0, 1.0)?;
            let neg = (prob.powf(self.gamma)?.affine(1.0 - self.alpha, 0.0)?
                * one_minus.affine(1.0, LOG_EPS)?.log()?.neg()?)?;
            let pos = (one_minus.powf(self.gamma)?.affine(self.alpha, 0.0)?
                * prob.affine(1.0, LOG_EPS)?.log()?.neg()?)?;
            Ok((pos - neg)?)
        } else {
            let prob = softmax_last_dim(logits)?.index_select(tgt_ids, 1)?;
            Ok(prob.neg()?)
        }
    }

    /// Optimal assignment per image. Solves run in parallel across images.
    pub fn forward(
        &self,
        logits: &Tensor,
        boxes: &Tensor,
        targets: &[ImageTargets],
    ) -> Result<Vec<Assignment>> {
        let matrices = self.cost_matrices(logits, boxes, targets)?;
        let assignments = matrices
            .par_iter()
            .map(linear_sum_assignment)
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "matched {} pairs over {} images",
            assignments.iter().map(Assignment::len).sum::<usize>(),
            assignments.len()
        );
        Ok(assignments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::GroundTruthObject;
    use candle_core::Device;

    fn matcher(use_focal_loss: bool) -> HungarianMatcher {
        let config = MatcherConfig {
            use_focal_loss,
            ..Default::default()
        };
        HungarianMatcher::new(&config, 2)
    }

    fn predictions(device: &Device) -> (Tensor, Tensor) {
        // query 1 looks like class 0 at the gt box, query 2 like class 1
        let logits = Tensor::new(
            &[[[-5f32, -5.0], [5.0, -5.0], [-5.0, 5.0]]],
            device,
        )
        .unwrap();
        let boxes = Tensor::new(
            &[[
                [0.5f32, 0.5, 0.2, 0.2],
                [0.2, 0.2, 0.1, 0.1],
                [0.7, 0.6, 0.2, 0.3],
            ]],
            device,
        )
        .unwrap();
        (logits, boxes)
    }

    fn targets() -> Vec<ImageTargets> {
        vec![ImageTargets::new(
            0,
            vec![
                GroundTruthObject::new(1, [0.7, 0.6, 0.2, 0.3]),
                GroundTruthObject::new(0, [0.2, 0.2, 0.1, 0.1]),
            ],
        )]
    }

    #[test]
    fn test_focal_matching() {
        let device = Device::Cpu;
        let (logits, boxes) = predictions(&device);
        let a = matcher(true).forward(&logits, &boxes, &targets()).unwrap();
        assert_eq!(a[0].pairs(), &[(1, 1), (2, 0)]);
    }

    #[test]
    fn test_cost_matrix_layout() {
        let device = Device::Cpu;
        let (logits, boxes) = predictions(&device);
        let m = matcher(true)
            .cost_matrices(&logits, &boxes, &targets())
            .unwrap();
        assert_eq!(m[0].num_queries(), 3);
        assert_eq!(m[0].num_gt(), 2);
        // exact box match, most confident query for the class: zero cost
        assert!(m[0].get(2, 0).abs() < 1e-5);
        assert!(m[0].get(0, 0) > m[0].get(2, 0));
    }

    #[test]
    fn test_class_cost_is_non_negative() {
        let device = Device::Cpu;
        let (logits, boxes) = predictions(&device);
        let logits = Tensor::cat(&[&logits, &logits.affine(-1.0, 0.0).unwrap()], 0).unwrap();
        let boxes = Tensor::cat(&[&boxes, &boxes], 0).unwrap();
        let t = vec![targets()[0].clone(), targets()[0].clone()];
        for use_focal_loss in [true, false] {
            let config = MatcherConfig {
                use_focal_loss,
                cost_bbox: 0.0,
                cost_giou: 0.0,
                ..Default::default()
            };
            let logits = if use_focal_loss {
                logits.clone()
            } else {
                let no_object = Tensor::full(-5f32, (2, 3, 1), &device).unwrap();
                Tensor::cat(&[&logits, &no_object], 2).unwrap()
            };
            let m = HungarianMatcher::new(&config, 2)
                .cost_matrices(&logits, &boxes, &t)
                .unwrap();
            for matrix in &m {
                for g in 0..matrix.num_gt() {
                    let column: Vec<f32> =
                        (0..matrix.num_queries()).map(|q| matrix.get(q, g)).collect();
                    assert!(column.iter().all(|&c| c >= -1e-6), "{:?}", column);
                    let min = column.iter().copied().fold(f32::INFINITY, f32::min);
                    assert!(min.abs() < 1e-6, "{:?}", column);
                }
            }
        }
    }

    #[test]
    fn test_softmax_matching() {
        let device = Device::Cpu;
        let (logits, boxes) = predictions(&device);
        let no_object = Tensor::full(-5f32, (1, 3, 1), &device).unwrap();
        let logits = Tensor::cat(&[&logits, &no_object], 2).unwrap();
        let a = matcher(false).forward(&logits, &boxes, &targets()).unwrap();
        assert_eq!(a[0].pairs(), &[(1, 1), (2, 0)]);
    }

    #[test]
    fn test_empty_image_in_batch() {
        let device = Device::Cpu;
        let (logits, boxes) = predictions(&device);
        let logits = Tensor::cat(&[&logits, &logits], 0).unwrap();
        let boxes = Tensor::cat(&[&boxes, &boxes], 0).unwrap();
        let mut t = targets();
        t.insert(0, ImageTargets::new(9, vec![]));
        let a = matcher(true).forward(&logits, &boxes, &t).unwrap();
        assert!(a[0].is_empty());
        assert_eq!(a[1].pairs(), &[(1, 1), (2, 0)]);

        let none = vec![ImageTargets::new(1, vec![]), ImageTargets::new(2, vec![])];
        let a = matcher(true).forward(&logits, &boxes, &none).unwrap();
        assert!(a.iter().all(Assignment::is_empty));
    }

    #[test]
    fn test_class_count_mismatch() {
        let device = Device::Cpu;
        let (logits, boxes) = predictions(&device);
        let m = HungarianMatcher::new(&MatcherConfig::default(), 80);
        assert!(matches!(
            m.forward(&logits, &boxes, &targets()),
            Err(DetrError::Shape(_))
        ));
    }
}
