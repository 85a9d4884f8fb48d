//! Set criterion
//!
//! Scores decoder outputs against ground truth: every scored layer gets an
//! assignment (bipartite matching, or the known identity for denoising
//! slots), then classification, box and cardinality losses are computed from
//! it and the per-layer dictionaries are folded by [`WeightedReducer`].

use std::collections::BTreeMap;

use candle_core::{DType, Tensor, D};
use candle_nn::ops::{log_softmax, sigmoid};
use log::debug;

use crate::assignment::Assignment;
use crate::box_ops::{self, box_cxcywh_to_xyxy, paired_generalized_box_iou};
use crate::config::{AuxMatching, LossKind, RtDetrConfig};
use crate::denoising::DenoisingMeta;
use crate::error::{DetrError, Result};
use crate::losses::{LayerKind, LayerLosses, LossDict, WeightedReducer};
use crate::matcher::HungarianMatcher;
use crate::target::{total_objects, ImageTargets};

/// Predictions of one decoder (or encoder) layer.
#[derive(Debug, Clone)]
pub struct LayerOutput {
    /// Class logits `[B, Q, C]`
    pub logits: Tensor,
    /// Boxes `[B, Q, 4]`, center/size normalized
    pub boxes: Tensor,
}

impl LayerOutput {
    pub fn new(logits: Tensor, boxes: Tensor) -> Self {
        Self { logits, boxes }
    }
}

/// Denoising slots of every decoder layer plus their bookkeeping.
#[derive(Debug, Clone)]
pub struct DenoisingOutputs {
    pub layers: Vec<LayerOutput>,
    pub meta: DenoisingMeta,
}

/// Everything the criterion scores for one training step.
#[derive(Debug, Clone)]
pub struct DetrOutputs {
    pub main: LayerOutput,
    pub aux: Vec<LayerOutput>,
    pub encoder: Vec<LayerOutput>,
    pub denoising: Option<DenoisingOutputs>,
}

impl DetrOutputs {
    /// Assemble from raw decoder layers (last = final layer).
    ///
    /// When `meta` is given, every layer holds `num_denoising + num_queries`
    /// slots and is split into its denoising and learned parts.
    pub fn from_decoder_layers(
        layers: Vec<LayerOutput>,
        encoder: Vec<LayerOutput>,
        meta: Option<&DenoisingMeta>,
        aux_loss: bool,
    ) -> Result<Self> {
        let mut learned = Vec::with_capacity(layers.len());
        let mut dn_layers = Vec::new();
        for layer in layers {
            match meta {
                Some(meta) => {
                    let (dn_logits, logits) = meta.split(&layer.logits)?;
                    let (dn_boxes, boxes) = meta.split(&layer.boxes)?;
                    dn_layers.push(LayerOutput::new(dn_logits, dn_boxes));
                    learned.push(LayerOutput::new(logits, boxes));
                }
                None => learned.push(layer),
            }
        }
        let main = learned
            .pop()
            .ok_or_else(|| DetrError::shape("model returned no decoder layers"))?;
        let aux = if aux_loss { learned } else { Vec::new() };
        let denoising = meta.map(|meta| DenoisingOutputs {
            layers: if aux_loss {
                dn_layers
            } else {
                dn_layers.into_iter().last().into_iter().collect()
            },
            meta: meta.clone(),
        });
        Ok(Self {
            main,
            aux,
            encoder,
            denoising,
        })
    }
}

/// Result of one criterion evaluation.
#[derive(Debug, Clone)]
pub struct CriterionOutput {
    /// Weighted sum of all weighted losses, a scalar to call `backward` on
    pub total: Tensor,
    /// Every loss under its full name (`loss_giou_aux_2`, ...)
    pub losses: BTreeMap<String, Tensor>,
    /// Final-layer assignment per image
    pub assignments: Vec<Assignment>,
}

impl CriterionOutput {
    /// Host copies of the total (as `loss`) and every named loss.
    pub fn scalars(&self) -> Result<BTreeMap<String, f32>> {
        let mut out = BTreeMap::new();
        out.insert(
            "loss".to_string(),
            self.total.to_dtype(DType::F32)?.to_scalar::<f32>()?,
        );
        for (name, value) in &self.losses {
            out.insert(name.clone(), value.to_dtype(DType::F32)?.to_scalar::<f32>()?);
        }
        Ok(out)
    }
}

/// Matched predictions of one layer, flattened across the batch.
struct Matched {
    /// Flat `b * Q + q` indices into the layer's queries
    src: Vec<u32>,
    labels: Vec<u32>,
    boxes: Vec<f32>,
}

impl Matched {
    fn collect(assignments: &[Assignment], targets: &[ImageTargets], num_queries: usize) -> Self {
        let mut m = Matched {
            src: Vec::new(),
            labels: Vec::new(),
            boxes: Vec::new(),
        };
        for (b, (assignment, t)) in assignments.iter().zip(targets).enumerate() {
            for &(q, g) in assignment.pairs() {
                let obj = &t.objects[g];
                m.src.push((b * num_queries + q) as u32);
                m.labels.push(obj.label as u32);
                m.boxes.extend_from_slice(&obj.bbox);
            }
        }
        m
    }

    fn len(&self) -> usize {
        self.src.len()
    }

    fn is_empty(&self) -> bool {
        self.src.is_empty()
    }
}

/// DETR-style set criterion with focal/varifocal classification, L1 + GIoU
/// box regression and a cardinality diagnostic.
#[derive(Debug, Clone)]
pub struct SetCriterion {
    matcher: HungarianMatcher,
    reducer: WeightedReducer,
    losses: Vec<LossKind>,
    num_classes: usize,
    alpha: f64,
    gamma: f64,
    aux_matching: AuxMatching,
    use_focal_loss: bool,
}

impl SetCriterion {
    pub fn from_config(config: &RtDetrConfig) -> Result<Self> {
        config.validate()?;
        let c = &config.criterion;
        Ok(Self {
            matcher: HungarianMatcher::from_config(config),
            reducer: WeightedReducer::from_config(config),
            losses: c.losses.clone(),
            num_classes: config.num_classes(),
            alpha: c.alpha,
            gamma: c.gamma,
            aux_matching: c.aux_matching,
            use_focal_loss: config.model.postprocessor.use_focal_loss,
        })
    }

    /// Score all outputs of one step.
    pub fn forward(
        &self,
        outputs: &DetrOutputs,
        targets: &[ImageTargets],
    ) -> Result<CriterionOutput> {
        let num_boxes = total_objects(targets).max(1) as f64;
        let mut layers = Vec::new();

        let main_assign = self.match_layer(&outputs.main, targets)?;
        layers.push(LayerLosses::new(
            LayerKind::Main,
            self.layer_losses(&outputs.main, targets, &main_assign, num_boxes)?,
        ));

        for (i, aux) in outputs.aux.iter().enumerate() {
            let losses = match self.aux_matching {
                AuxMatching::PerLayer => {
                    let assign = self.match_layer(aux, targets)?;
                    self.layer_losses(aux, targets, &assign, num_boxes)?
                }
                AuxMatching::ReuseFinal => {
                    self.layer_losses(aux, targets, &main_assign, num_boxes)?
                }
            };
            layers.push(LayerLosses::new(LayerKind::Aux(i), losses));
        }

        for (i, enc) in outputs.encoder.iter().enumerate() {
            let assign = self.match_layer(enc, targets)?;
            layers.push(LayerLosses::new(
                LayerKind::Encoder(i),
                self.layer_losses(enc, targets, &assign, num_boxes)?,
            ));
        }

        if let Some(dn) = &outputs.denoising {
            if dn.meta.positive.len() != targets.len() {
                return Err(DetrError::shape(format!(
                    "denoising assignments cover {} images, batch has {}",
                    dn.meta.positive.len(),
                    targets.len()
                )));
            }
            let num_dn_boxes = dn.meta.num_positive().max(1) as f64;
            let device = outputs.main.logits.device();
            let slot_weights = dn.meta.slot_weights(device)?;
            for (i, layer) in dn.layers.iter().enumerate() {
                let losses = self.scored_losses(
                    layer,
                    targets,
                    &dn.meta.positive,
                    num_dn_boxes,
                    Some(&slot_weights),
                )?;
                layers.push(LayerLosses::new(LayerKind::Denoising(i), losses));
            }
        }

        let (total, losses) = self.reducer.reduce(&layers)?;
        debug!("criterion scored {} layers, {} losses", layers.len(), losses.len());
        Ok(CriterionOutput {
            total,
            losses,
            assignments: main_assign,
        })
    }

    fn match_layer(&self, out: &LayerOutput, targets: &[ImageTargets]) -> Result<Vec<Assignment>> {
        self.matcher.forward(&out.logits, &out.boxes, targets)
    }

    /// All configured losses of one layer under a fixed assignment.
    pub fn layer_losses(
        &self,
        out: &LayerOutput,
        targets: &[ImageTargets],
        assignments: &[Assignment],
        num_boxes: f64,
    ) -> Result<LossDict> {
        self.scored_losses(out, targets, assignments, num_boxes, None)
    }

    /// `slot_weights` (`[B, Q, 1]`, 0 or 1) marks a denoising layer: padding
    /// slots drop out of the classification loss and cardinality is skipped.
    fn scored_losses(
        &self,
        out: &LayerOutput,
        targets: &[ImageTargets],
        assignments: &[Assignment],
        num_boxes: f64,
        slot_weights: Option<&Tensor>,
    ) -> Result<LossDict> {
        let (bs, num_queries, channels) = out.logits.dims3()?;
        if channels != self.matcher.logit_channels() || assignments.len() != bs {
            return Err(DetrError::shape(format!(
                "layer logits {:?} do not fit {} classes and {} assignments",
                out.logits.dims(),
                self.num_classes,
                assignments.len()
            )));
        }
        if let Some(w) = slot_weights {
            if w.dims() != [bs, num_queries, 1] {
                return Err(DetrError::shape(format!(
                    "slot weights {:?} do not fit layer logits {:?}",
                    w.dims(),
                    out.logits.dims()
                )));
            }
        }
        let matched = Matched::collect(assignments, targets, num_queries);

        let mut dict = LossDict::new();
        for kind in &self.losses {
            match kind {
                LossKind::Focal => {
                    let loss = self.loss_focal(out, &matched, num_boxes, slot_weights)?;
                    dict.insert("loss_ce".to_string(), loss);
                }
                LossKind::Labels => {
                    let loss = self.loss_labels(out, &matched, slot_weights)?;
                    dict.insert("loss_ce".to_string(), loss);
                }
                LossKind::Vfl => {
                    let loss = self.loss_vfl(out, &matched, num_boxes, slot_weights)?;
                    dict.insert("loss_vfl".to_string(), loss);
                }
                LossKind::Boxes => {
                    let (l1, giou) = self.loss_boxes(out, &matched, num_boxes)?;
                    dict.insert("loss_bbox".to_string(), l1);
                    dict.insert("loss_giou".to_string(), giou);
                }
                LossKind::Cardinality if slot_weights.is_none() => {
                    dict.insert(
                        "loss_cardinality".to_string(),
                        self.loss_cardinality(out, targets)?,
                    );
                }
                LossKind::Cardinality => {}
            }
        }
        Ok(dict)
    }

    /// `[B, Q, C]` target scores: `value[k]` at each matched `(query, label)`.
    fn target_scores(&self, logits: &Tensor, matched: &Matched, values: &[f32]) -> Result<Tensor> {
        let (bs, num_queries, channels) = logits.dims3()?;
        let mut t = vec![0f32; bs * num_queries * channels];
        for ((&src, &label), &v) in matched.src.iter().zip(&matched.labels).zip(values) {
            t[src as usize * channels + label as usize] = v;
        }
        let t = Tensor::from_vec(t, (bs, num_queries, channels), logits.device())?;
        Ok(t.to_dtype(logits.dtype())?)
    }

    /// Sigmoid focal loss over every query and class, summed and divided by
    /// the number of boxes.
    fn loss_focal(
        &self,
        out: &LayerOutput,
        matched: &Matched,
        num_boxes: f64,
        slot_weights: Option<&Tensor>,
    ) -> Result<Tensor> {
        let x = &out.logits;
        let t = self.target_scores(x, matched, &vec![1.0; matched.len()])?;
        let p = sigmoid(x)?;
        let ce = bce_with_logits(x, &t)?;
        // 1 - p_t = p + t - 2 p t for binary t
        let one_minus_pt = ((&p + &t)? - (&p * &t)?.affine(2.0, 0.0)?)?;
        let alpha_t = t.affine(2.0 * self.alpha - 1.0, 1.0 - self.alpha)?;
        let loss = ((ce * one_minus_pt.powf(self.gamma)?)? * alpha_t)?;
        let loss = weighted(loss, slot_weights)?;
        Ok(loss.sum_all()?.affine(1.0 / num_boxes, 0.0)?)
    }

    /// Varifocal loss: matched queries regress their class score towards the
    /// IoU with their ground truth.
    fn loss_vfl(
        &self,
        out: &LayerOutput,
        matched: &Matched,
        num_boxes: f64,
        slot_weights: Option<&Tensor>,
    ) -> Result<Tensor> {
        let x = &out.logits;
        let ious = self.matched_ious(out, matched)?;
        let ones = vec![1f32; matched.len()];
        let t = self.target_scores(x, matched, &ious)?;
        let positive = self.target_scores(x, matched, &ones)?;

        let pred = sigmoid(x)?.detach();
        let negative = positive.affine(-1.0, 1.0)?;
        let weight = ((pred.powf(self.gamma)?.affine(self.alpha, 0.0)? * negative)? + &t)?;
        let loss = weighted((bce_with_logits(x, &t)? * weight)?, slot_weights)?;
        Ok(loss.sum_all()?.affine(1.0 / num_boxes, 0.0)?)
    }

    /// Detached IoU of each matched pair.
    fn matched_ious(&self, out: &LayerOutput, matched: &Matched) -> Result<Vec<f32>> {
        if matched.is_empty() {
            return Ok(Vec::new());
        }
        let pred = gather_boxes(&out.boxes.detach(), &matched.src)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;
        Ok(pred
            .iter()
            .zip(matched.boxes.chunks_exact(4))
            .map(|(p, g)| {
                let p = [p[0], p[1], p[2], p[3]];
                let g = [g[0], g[1], g[2], g[3]];
                box_ops::iou(box_ops::to_corners(p), box_ops::to_corners(g))
            })
            .collect())
    }

    /// Softmax cross-entropy; unmatched queries target the no-object class.
    /// With slot weights, the mean runs over weighted slots only.
    fn loss_labels(
        &self,
        out: &LayerOutput,
        matched: &Matched,
        slot_weights: Option<&Tensor>,
    ) -> Result<Tensor> {
        let x = &out.logits;
        let (bs, num_queries, channels) = x.dims3()?;
        let mut t = vec![0f32; bs * num_queries * channels];
        for row in 0..bs * num_queries {
            t[row * channels + self.num_classes] = 1.0;
        }
        for (&src, &label) in matched.src.iter().zip(&matched.labels) {
            let row = src as usize * channels;
            t[row + self.num_classes] = 0.0;
            t[row + label as usize] = 1.0;
        }
        let t = Tensor::from_vec(t, (bs, num_queries, channels), x.device())?;
        let t = t.to_dtype(x.dtype())?;
        let nll = (log_softmax(x, D::Minus1)? * t)?.sum_keepdim(D::Minus1)?.neg()?;
        match slot_weights {
            None => Ok(nll.mean_all()?),
            Some(w) => {
                let count = w.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
                let sum = weighted(nll, Some(w))?.sum_all()?;
                Ok(sum.affine(1.0 / count.max(1.0) as f64, 0.0)?)
            }
        }
    }

    /// L1 and `1 - GIoU` over matched pairs. Zero when nothing is matched.
    fn loss_boxes(
        &self,
        out: &LayerOutput,
        matched: &Matched,
        num_boxes: f64,
    ) -> Result<(Tensor, Tensor)> {
        let device = out.boxes.device();
        if matched.is_empty() {
            let zero = Tensor::zeros((), out.boxes.dtype(), device)?;
            return Ok((zero.clone(), zero));
        }
        let src = gather_boxes(&out.boxes, &matched.src)?;
        let tgt = Tensor::from_vec(matched.boxes.clone(), (matched.len(), 4), device)?
            .to_dtype(src.dtype())?;

        let l1 = (&src - &tgt)?.abs()?.sum_all()?.affine(1.0 / num_boxes, 0.0)?;
        let giou =
            paired_generalized_box_iou(&box_cxcywh_to_xyxy(&src)?, &box_cxcywh_to_xyxy(&tgt)?)?;
        let giou = giou.affine(-1.0, 1.0)?.sum_all()?.affine(1.0 / num_boxes, 0.0)?;
        Ok((l1, giou))
    }

    /// Mean absolute error between predicted and true object counts.
    /// Computed on host values, so it carries no gradient.
    fn loss_cardinality(&self, out: &LayerOutput, targets: &[ImageTargets]) -> Result<Tensor> {
        let logits = out.logits.detach().to_dtype(DType::F32)?.to_vec3::<f32>()?;
        let mut err = 0f32;
        for (image, t) in logits.iter().zip(targets) {
            let count = image
                .iter()
                .filter(|q| self.is_foreground(q))
                .count();
            err += (count as f32 - t.len() as f32).abs();
        }
        let err = err / targets.len().max(1) as f32;
        Ok(Tensor::new(err, out.logits.device())?)
    }

    fn is_foreground(&self, logits: &[f32]) -> bool {
        if self.use_focal_loss {
            logits.iter().any(|&l| l > 0.0)
        } else {
            let mut best = 0;
            for (c, &l) in logits.iter().enumerate() {
                if l > logits[best] {
                    best = c;
                }
            }
            best != self.num_classes
        }
    }
}

/// `log(1 + exp(-|x|)) + max(x, 0) - x * t`, stable for large `|x|`.
fn bce_with_logits(x: &Tensor, t: &Tensor) -> Result<Tensor> {
    let softplus = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok(((x.relu()? - (x * t)?)? + softplus)?)
}

/// Scale a `[B, Q, ..]` element loss by `[B, Q, 1]` slot weights.
fn weighted(loss: Tensor, slot_weights: Option<&Tensor>) -> Result<Tensor> {
    match slot_weights {
        None => Ok(loss),
        Some(w) => Ok(loss.broadcast_mul(&w.to_dtype(loss.dtype())?)?),
    }
}

/// Rows `idx` of `boxes [B, Q, 4]` flattened to `[B*Q, 4]`.
fn gather_boxes(boxes: &Tensor, idx: &[u32]) -> Result<Tensor> {
    let (bs, num_queries, _) = boxes.dims3()?;
    let idx = Tensor::new(idx, boxes.device())?;
    Ok(boxes.reshape((bs * num_queries, 4))?.index_select(&idx, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denoising::{DenoisingQueries, DenoisingQueryGenerator, Mode};
    use crate::target::GroundTruthObject;
    use candle_core::Device;

    const BIG: f32 = 8.0;

    fn config() -> RtDetrConfig {
        let mut config = RtDetrConfig::default();
        config.model.num_classes = 4;
        config.model.decoder.num_queries = 6;
        config
    }

    fn targets() -> Vec<ImageTargets> {
        vec![ImageTargets::new(
            1,
            vec![
                GroundTruthObject::new(1, [0.3, 0.3, 0.2, 0.2]),
                GroundTruthObject::new(2, [0.7, 0.6, 0.2, 0.3]),
            ],
        )]
    }

    /// Queries 2 and 4 reproduce the ground truth; the rest are confident
    /// background.
    fn perfect(device: &Device) -> LayerOutput {
        let mut logits = vec![-BIG; 6 * 4];
        logits[2 * 4 + 1] = BIG;
        logits[4 * 4 + 2] = BIG;
        let mut boxes = vec![0.5f32, 0.5, 0.05, 0.05].repeat(6);
        boxes[8..12].copy_from_slice(&[0.3, 0.3, 0.2, 0.2]);
        boxes[16..20].copy_from_slice(&[0.7, 0.6, 0.2, 0.3]);
        LayerOutput::new(
            Tensor::from_vec(logits, (1, 6, 4), device).unwrap(),
            Tensor::from_vec(boxes, (1, 6, 4), device).unwrap(),
        )
    }

    fn value(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_perfect_predictions() {
        let device = Device::Cpu;
        let criterion = SetCriterion::from_config(&config()).unwrap();
        let outputs = DetrOutputs {
            main: perfect(&device),
            aux: vec![],
            encoder: vec![],
            denoising: None,
        };
        let out = criterion.forward(&outputs, &targets()).unwrap();
        assert_eq!(out.assignments[0].pairs(), &[(2, 0), (4, 1)]);
        assert!(value(&out.losses["loss_bbox"]).abs() < 1e-5);
        assert!(value(&out.losses["loss_giou"]).abs() < 1e-5);
        assert!(value(&out.losses["loss_ce"]) < 1e-3);
        assert_eq!(value(&out.losses["loss_cardinality"]), 0.0);
    }

    #[test]
    fn test_box_losses_normalized_by_batch_count() {
        let device = Device::Cpu;
        let criterion = SetCriterion::from_config(&config()).unwrap();
        let mut layer = perfect(&device);
        // shift query 2 by 0.1 in cx: L1 = 0.1 over 2 boxes
        let shift = Tensor::from_vec(
            {
                let mut v = vec![0f32; 24];
                v[8] = 0.1;
                v
            },
            (1, 6, 4),
            &device,
        )
        .unwrap();
        layer.boxes = (layer.boxes + shift).unwrap();
        let dict = criterion
            .layer_losses(&layer, &targets(), &[Assignment::new(vec![(2, 0), (4, 1)])], 2.0)
            .unwrap();
        assert!((value(&dict["loss_bbox"]) - 0.05).abs() < 1e-5);
        assert!(value(&dict["loss_giou"]) > 0.0);
    }

    #[test]
    fn test_empty_batch_has_zero_box_loss() {
        let device = Device::Cpu;
        let criterion = SetCriterion::from_config(&config()).unwrap();
        let mut layer = perfect(&device);
        layer.logits = Tensor::full(-BIG, (1, 6, 4), &device).unwrap();
        let outputs = DetrOutputs {
            main: layer,
            aux: vec![],
            encoder: vec![],
            denoising: None,
        };
        let empty = vec![ImageTargets::new(3, vec![])];
        let out = criterion.forward(&outputs, &empty).unwrap();
        assert_eq!(value(&out.losses["loss_bbox"]), 0.0);
        assert_eq!(value(&out.losses["loss_giou"]), 0.0);
        assert!(value(&out.total).is_finite());
    }

    #[test]
    fn test_cardinality_counts_confident_queries() {
        let device = Device::Cpu;
        let criterion = SetCriterion::from_config(&config()).unwrap();
        let mut layer = perfect(&device);
        layer.logits = Tensor::full(BIG, (1, 6, 4), &device).unwrap();
        let empty = vec![ImageTargets::new(3, vec![])];
        let dict = criterion
            .layer_losses(&layer, &empty, &[Assignment::default()], 1.0)
            .unwrap();
        assert_eq!(value(&dict["loss_cardinality"]), 6.0);
    }

    #[test]
    fn test_aux_and_names() {
        let device = Device::Cpu;
        let mut cfg = config();
        cfg.criterion.aux_matching = AuxMatching::ReuseFinal;
        let criterion = SetCriterion::from_config(&cfg).unwrap();
        let layers = vec![perfect(&device), perfect(&device), perfect(&device)];
        let outputs =
            DetrOutputs::from_decoder_layers(layers, vec![perfect(&device)], None, true).unwrap();
        assert_eq!(outputs.aux.len(), 2);
        let out = criterion.forward(&outputs, &targets()).unwrap();
        for name in ["loss_ce", "loss_ce_aux_0", "loss_bbox_aux_1", "loss_giou_enc_0"] {
            assert!(out.losses.contains_key(name), "missing {}", name);
        }
        let scalars = out.scalars().unwrap();
        assert!(scalars["loss"] < 1e-2);
    }

    #[test]
    fn test_vfl_and_labels_losses() {
        let device = Device::Cpu;
        let mut cfg = config();
        cfg.criterion.losses = vec![LossKind::Vfl, LossKind::Boxes];
        cfg.criterion.weight_dict.insert("loss_vfl".to_string(), 1.0);
        let criterion = SetCriterion::from_config(&cfg).unwrap();
        let assign = [Assignment::new(vec![(2, 0), (4, 1)])];
        let dict = criterion
            .layer_losses(&perfect(&device), &targets(), &assign, 2.0)
            .unwrap();
        assert!(value(&dict["loss_vfl"]) < 1e-2);

        let mut cfg = config();
        cfg.model.postprocessor.use_focal_loss = false;
        cfg.criterion.matcher.use_focal_loss = false;
        cfg.criterion.losses = vec![LossKind::Labels];
        let criterion = SetCriterion::from_config(&cfg).unwrap();
        // uniform logits over 4 classes + no-object
        let layer = LayerOutput::new(
            Tensor::zeros((1, 6, 5), DType::F32, &device).unwrap(),
            perfect(&device).boxes,
        );
        let dict = criterion.layer_losses(&layer, &targets(), &assign, 2.0).unwrap();
        assert!((value(&dict["loss_ce"]) - 5f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_wrong_class_count_fails() {
        let device = Device::Cpu;
        let criterion = SetCriterion::from_config(&config()).unwrap();
        let layer = LayerOutput::new(
            Tensor::zeros((1, 6, 80), DType::F32, &device).unwrap(),
            perfect(&device).boxes,
        );
        let outputs = DetrOutputs {
            main: layer,
            aux: vec![],
            encoder: vec![],
            denoising: None,
        };
        assert!(criterion.forward(&outputs, &targets()).is_err());
    }

    /// Images with 2, 1 and 0 objects. With 4 denoising slots: M = 2, two
    /// groups, and image 1 has a padding slot in each half.
    fn dn_batch() -> (Vec<ImageTargets>, DenoisingQueries) {
        let targets = vec![
            ImageTargets::new(
                1,
                vec![
                    GroundTruthObject::new(1, [0.3, 0.3, 0.2, 0.2]),
                    GroundTruthObject::new(2, [0.7, 0.6, 0.2, 0.3]),
                ],
            ),
            ImageTargets::new(2, vec![GroundTruthObject::new(3, [0.5, 0.5, 0.4, 0.4])]),
            ImageTargets::new(3, vec![]),
        ];
        // no label or box noise: positive slots carry the ground truth as is
        let generator = DenoisingQueryGenerator::new(4, 6, 4, 0.0, 0.0, 5).unwrap();
        let dn = generator
            .generate(&targets, 0, Mode::Train, &Device::Cpu)
            .unwrap()
            .unwrap();
        (targets, dn)
    }

    /// `[B, num_dn, 4]` logits: confident true label on positive slots,
    /// confident background on negative slots, `padding` on padding slots.
    fn dn_logits(dn: &DenoisingQueries, targets: &[ImageTargets], padding: f32) -> Vec<f32> {
        let meta = &dn.meta;
        let num_dn = meta.num_denoising_queries;
        let mut logits = vec![-BIG; targets.len() * num_dn * 4];
        for (b, t) in targets.iter().enumerate() {
            for s in 0..num_dn {
                if !meta.is_valid_slot(b, s) {
                    let row = (b * num_dn + s) * 4;
                    logits[row..row + 4].fill(padding);
                }
            }
            for &(s, g) in meta.positive[b].pairs() {
                logits[(b * num_dn + s) * 4 + t.objects[g].label] = BIG;
            }
        }
        logits
    }

    fn dn_outputs(dn: &DenoisingQueries, logits: Vec<f32>, boxes: Tensor) -> DetrOutputs {
        let device = Device::Cpu;
        let shape = (3, dn.meta.num_denoising_queries, 4);
        let layer = LayerOutput::new(Tensor::from_vec(logits, shape, &device).unwrap(), boxes);
        DetrOutputs {
            main: LayerOutput::new(
                Tensor::full(-BIG, (3, 6, 4), &device).unwrap(),
                Tensor::full(0.5f32, (3, 6, 4), &device).unwrap(),
            ),
            aux: vec![],
            encoder: vec![],
            denoising: Some(DenoisingOutputs {
                layers: vec![layer],
                meta: dn.meta.clone(),
            }),
        }
    }

    #[test]
    fn test_echoed_denoising_slots_have_zero_loss() {
        let (targets, dn) = dn_batch();
        assert_eq!(dn.meta.num_positive(), 6);
        let criterion = SetCriterion::from_config(&config()).unwrap();
        let outputs = dn_outputs(&dn, dn_logits(&dn, &targets, -BIG), dn.boxes.clone());
        let out = criterion.forward(&outputs, &targets).unwrap();

        assert!(value(&out.losses["loss_bbox_dn_0"]).abs() < 1e-5);
        assert!(value(&out.losses["loss_giou_dn_0"]).abs() < 1e-5);
        assert!(value(&out.losses["loss_ce_dn_0"]) < 1e-3);
        assert!(!out.losses.contains_key("loss_cardinality_dn_0"));
        assert!(out.losses.contains_key("loss_cardinality"));
    }

    #[test]
    fn test_denoising_box_loss_normalized_by_positive_slots() {
        let (targets, dn) = dn_batch();
        let criterion = SetCriterion::from_config(&config()).unwrap();
        // move the first positive slot of image 0 by 0.1 in cx
        let mut boxes = dn.boxes.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        boxes[0] += 0.1;
        let boxes = Tensor::from_vec(boxes, dn.boxes.dims(), &Device::Cpu).unwrap();
        let outputs = dn_outputs(&dn, dn_logits(&dn, &targets, -BIG), boxes);
        let out = criterion.forward(&outputs, &targets).unwrap();

        assert!((value(&out.losses["loss_bbox_dn_0"]) - 0.1 / 6.0).abs() < 1e-5);
        assert!(value(&out.losses["loss_giou_dn_0"]) > 0.0);
    }

    #[test]
    fn test_padding_slots_do_not_add_loss() {
        let (targets, dn) = dn_batch();
        let criterion = SetCriterion::from_config(&config()).unwrap();
        let score = |logits: Vec<f32>| {
            let outputs = dn_outputs(&dn, logits, dn.boxes.clone());
            let out = criterion.forward(&outputs, &targets).unwrap();
            value(&out.losses["loss_ce_dn_0"])
        };

        // padding covers all of image 2 and half of each group of image 1
        let background = score(dn_logits(&dn, &targets, -BIG));
        let confident = score(dn_logits(&dn, &targets, 5.0));
        assert!((background - confident).abs() < 1e-6, "{} vs {}", background, confident);

        // negative slots still count as background
        let mut logits = dn_logits(&dn, &targets, -BIG);
        let neg_slot = dn.meta.group_size;
        logits[neg_slot * 4] = 5.0;
        assert!(score(logits) > background + 0.1);
    }

    #[test]
    fn test_denoising_labels_loss_skips_padding() {
        let (targets, dn) = dn_batch();
        let mut cfg = config();
        cfg.model.postprocessor.use_focal_loss = false;
        cfg.criterion.matcher.use_focal_loss = false;
        cfg.criterion.losses = vec![LossKind::Labels];
        let criterion = SetCriterion::from_config(&cfg).unwrap();

        let device = Device::Cpu;
        let num_dn = dn.meta.num_denoising_queries;
        // uniform over 4 classes + no-object on object slots, garbage on padding
        let mut logits = vec![0f32; 3 * num_dn * 5];
        for b in 0..3 {
            for s in 0..num_dn {
                if !dn.meta.is_valid_slot(b, s) {
                    let row = (b * num_dn + s) * 5;
                    logits[row..row + 5].copy_from_slice(&[9.0, -9.0, -9.0, -9.0, -9.0]);
                }
            }
        }
        let layer = LayerOutput::new(
            Tensor::from_vec(logits, (3, num_dn, 5), &device).unwrap(),
            dn.boxes.clone(),
        );
        let outputs = DetrOutputs {
            main: LayerOutput::new(
                Tensor::zeros((3, 6, 5), DType::F32, &device).unwrap(),
                Tensor::full(0.5f32, (3, 6, 4), &device).unwrap(),
            ),
            aux: vec![],
            encoder: vec![],
            denoising: Some(DenoisingOutputs {
                layers: vec![layer],
                meta: dn.meta.clone(),
            }),
        };
        let out = criterion.forward(&outputs, &targets).unwrap();
        assert!((value(&out.losses["loss_ce_dn_0"]) - 5f32.ln()).abs() < 1e-5);
    }
}
