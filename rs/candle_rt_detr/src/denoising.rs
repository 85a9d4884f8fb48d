//! Contrastive denoising queries
//!
//! During training the ground truth of each image is copied into extra
//! decoder queries with label and box noise. Every group holds a positive
//! half (small box noise, should reconstruct the object) and a negative half
//! (large box noise, should be rejected as background).
//!
//! Layout of the denoising part of the query sequence, with `M` slots per half:
//!
//! ```text
//! | group 0: pos[0..M] neg[0..M] | group 1: pos neg | ... | learned queries |
//! ```
//!
//! The [`AttentionIsolationMask`] keeps groups from seeing each other and
//! keeps the learned queries blind to every group.

use candle_core::{DType, Device, Tensor};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::assignment::Assignment;
use crate::box_ops::{inverse_sigmoid, to_center_size, to_corners};
use crate::config::RtDetrConfig;
use crate::error::{DetrError, Result};
use crate::target::ImageTargets;

/// Clamp used when turning noised boxes into unactivated reference points.
const REF_POINT_EPS: f64 = 1e-5;

/// Training or inference. Denoising queries exist only in training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Boolean self-attention mask over `num_denoising + num_queries` slots.
///
/// `true` means the row query may NOT attend to the column query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionIsolationMask {
    size: usize,
    blocked: Vec<bool>,
}

impl AttentionIsolationMask {
    /// Mask for `num_groups` groups of `group_len` slots followed by
    /// `num_queries` learned queries.
    fn build(num_groups: usize, group_len: usize, num_queries: usize) -> Self {
        let num_dn = num_groups * group_len;
        let size = num_dn + num_queries;
        let mut blocked = vec![false; size * size];
        for row in 0..size {
            for col in 0..size {
                blocked[row * size + col] = match (row < num_dn, col < num_dn) {
                    (false, false) => false,
                    (false, true) | (true, false) => true,
                    (true, true) => row / group_len != col / group_len,
                };
            }
        }
        Self { size, blocked }
    }

    /// Side length of the square mask.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether query `row` is kept from attending to query `col`.
    pub fn is_blocked(&self, row: usize, col: usize) -> bool {
        self.blocked[row * self.size + col]
    }

    /// `[T, T]` u8 tensor, 1 = blocked.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let data: Vec<u8> = self.blocked.iter().map(|&b| b as u8).collect();
        Ok(Tensor::from_vec(data, (self.size, self.size), device)?)
    }

    /// `[T, T]` f32 tensor to add to attention scores: 0 where allowed,
    /// negative infinity where blocked.
    pub fn to_additive(&self, device: &Device) -> Result<Tensor> {
        let data: Vec<f32> = self
            .blocked
            .iter()
            .map(|&b| if b { f32::NEG_INFINITY } else { 0.0 })
            .collect();
        Ok(Tensor::from_vec(data, (self.size, self.size), device)?)
    }
}

/// Bookkeeping the criterion needs to score denoising outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct DenoisingMeta {
    /// Number of contrastive groups
    pub num_groups: usize,
    /// Slots per half group (`M`)
    pub group_size: usize,
    /// Total denoising slots, `2 * M * num_groups`
    pub num_denoising_queries: usize,
    /// Learned queries that follow the denoising slots
    pub num_queries: usize,
    /// Per image, `(denoising slot, gt index)` for every positive slot
    pub positive: Vec<Assignment>,
    /// Per image, objects copied into each half group; slots at or past this
    /// index within a half are padding
    pub num_objects: Vec<usize>,
}

impl DenoisingMeta {
    /// Split a decoder output `[B, num_denoising + num_queries, ...]` into
    /// its denoising part and its learned-query part.
    pub fn split(&self, t: &Tensor) -> Result<(Tensor, Tensor)> {
        let total = t.dim(1)?;
        if total != self.num_denoising_queries + self.num_queries {
            return Err(DetrError::shape(format!(
                "decoder output has {} queries, expected {} denoising + {} learned",
                total, self.num_denoising_queries, self.num_queries
            )));
        }
        let dn = t.narrow(1, 0, self.num_denoising_queries)?;
        let learned = t.narrow(1, self.num_denoising_queries, self.num_queries)?;
        Ok((dn, learned))
    }

    /// Number of positive slots across the batch.
    pub fn num_positive(&self) -> usize {
        self.positive.iter().map(Assignment::len).sum()
    }

    /// Whether `slot` of image `image` holds a copied object (positive or
    /// negative) rather than padding.
    pub fn is_valid_slot(&self, image: usize, slot: usize) -> bool {
        let within_half = slot % (2 * self.group_size) % self.group_size;
        within_half < self.num_objects[image]
    }

    /// `[B, num_denoising_queries, 1]` weights, 1 for object slots and 0 for
    /// padding.
    pub fn slot_weights(&self, device: &Device) -> Result<Tensor> {
        let bs = self.num_objects.len();
        let data: Vec<f32> = (0..bs)
            .flat_map(|b| {
                (0..self.num_denoising_queries)
                    .map(move |s| if self.is_valid_slot(b, s) { 1.0 } else { 0.0 })
            })
            .collect();
        Ok(Tensor::from_vec(data, (bs, self.num_denoising_queries, 1), device)?)
    }
}

/// Decoder inputs produced for one training step.
#[derive(Debug, Clone)]
pub struct DenoisingQueries {
    /// Noised labels `[B, num_dn]` (u32); padding slots hold `num_classes`
    pub labels: Tensor,
    /// Noised boxes `[B, num_dn, 4]`, center/size
    pub boxes: Tensor,
    /// `inverse_sigmoid(boxes)`, the decoder's initial reference points
    pub ref_points_unact: Tensor,
    pub attn_mask: AttentionIsolationMask,
    pub meta: DenoisingMeta,
}

/// Noised slots of a single image.
struct ImageNoise {
    kept: usize,
    labels: Vec<u32>,
    boxes: Vec<[f32; 4]>,
    positive: Assignment,
}

/// Generates contrastive denoising queries from ground truth.
#[derive(Debug, Clone)]
pub struct DenoisingQueryGenerator {
    num_classes: usize,
    num_queries: usize,
    num_denoising: usize,
    label_noise_ratio: f64,
    box_noise_scale: f64,
    seed: u64,
}

impl DenoisingQueryGenerator {
    pub fn new(
        num_classes: usize,
        num_queries: usize,
        num_denoising: usize,
        label_noise_ratio: f64,
        box_noise_scale: f64,
        seed: u64,
    ) -> Result<Self> {
        if num_classes == 0 {
            return Err(DetrError::config("denoising needs at least one class"));
        }
        if !(0.0..=1.0).contains(&label_noise_ratio) {
            return Err(DetrError::config(format!(
                "label_noise_ratio {} is outside [0, 1]",
                label_noise_ratio
            )));
        }
        if !(box_noise_scale >= 0.0) {
            return Err(DetrError::config(format!(
                "box_noise_scale {} is negative",
                box_noise_scale
            )));
        }
        Ok(Self {
            num_classes,
            num_queries,
            num_denoising,
            label_noise_ratio,
            box_noise_scale,
            seed,
        })
    }

    pub fn from_config(config: &RtDetrConfig) -> Result<Self> {
        let d = &config.model.decoder;
        Self::new(
            config.num_classes(),
            d.num_queries,
            d.num_denoising,
            d.label_noise_ratio,
            d.box_noise_scale,
            config.seed,
        )
    }

    /// Build the denoising queries for one batch.
    ///
    /// Returns `None` in [`Mode::Eval`], when denoising is disabled, or when
    /// no image in the batch has an object. `step` and each image's
    /// `image_id` select the noise stream, so results do not depend on batch
    /// order or on the other images.
    pub fn generate(
        &self,
        targets: &[ImageTargets],
        step: u64,
        mode: Mode,
        device: &Device,
    ) -> Result<Option<DenoisingQueries>> {
        if mode == Mode::Eval || self.num_denoising == 0 {
            return Ok(None);
        }
        for t in targets {
            t.validate(self.num_classes)?;
        }
        let max_gt = targets.iter().map(ImageTargets::len).max().unwrap_or(0);
        if max_gt == 0 {
            return Ok(None);
        }

        let group_size = max_gt.min(self.num_denoising);
        if max_gt > group_size {
            warn!(
                "{} objects in one image exceed num_denoising = {}; extra objects are not denoised",
                max_gt, self.num_denoising
            );
        }
        let num_groups = (self.num_denoising / group_size).max(1);
        let num_dn = 2 * group_size * num_groups;

        let per_image: Vec<ImageNoise> = targets
            .par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(stream_seed(self.seed, step, t.image_id));
                self.noise_image(t, group_size, num_groups, &mut rng)
            })
            .collect();

        let bs = targets.len();
        let labels: Vec<u32> = per_image.iter().flat_map(|n| n.labels.iter().copied()).collect();
        let boxes: Vec<f32> = per_image
            .iter()
            .flat_map(|n| n.boxes.iter().flat_map(|b| b.iter().copied()))
            .collect();
        let labels = Tensor::from_vec(labels, (bs, num_dn), device)?;
        let boxes = Tensor::from_vec(boxes, (bs, num_dn, 4), device)?;
        let ref_points_unact = inverse_sigmoid(&boxes, REF_POINT_EPS)?.to_dtype(DType::F32)?;

        let meta = DenoisingMeta {
            num_groups,
            group_size,
            num_denoising_queries: num_dn,
            num_queries: self.num_queries,
            num_objects: per_image.iter().map(|n| n.kept).collect(),
            positive: per_image.into_iter().map(|n| n.positive).collect(),
        };
        debug!(
            "denoising: {} groups of {} slots, {} positives",
            num_groups,
            2 * group_size,
            meta.num_positive()
        );

        Ok(Some(DenoisingQueries {
            labels,
            boxes,
            ref_points_unact,
            attn_mask: AttentionIsolationMask::build(num_groups, 2 * group_size, self.num_queries),
            meta,
        }))
    }

    fn noise_image(
        &self,
        targets: &ImageTargets,
        group_size: usize,
        num_groups: usize,
        rng: &mut StdRng,
    ) -> ImageNoise {
        let kept = targets.len().min(group_size);
        let num_dn = 2 * group_size * num_groups;
        let pad_label = self.num_classes as u32;
        let mut labels = vec![pad_label; num_dn];
        let mut boxes = vec![[0f32; 4]; num_dn];
        let mut positive = Vec::with_capacity(kept * num_groups);

        for g in 0..num_groups {
            let base = g * 2 * group_size;
            for (i, obj) in targets.objects.iter().take(kept).enumerate() {
                let pos = base + i;
                let neg = base + group_size + i;
                for (slot, negative) in [(pos, false), (neg, true)] {
                    labels[slot] = self.noise_label(obj.label, rng);
                    boxes[slot] = self.noise_box(obj.bbox, negative, rng);
                }
                positive.push((pos, i));
            }
        }

        ImageNoise {
            kept,
            labels,
            boxes,
            positive: Assignment::new(positive),
        }
    }

    /// With probability `label_noise_ratio`, a uniformly drawn class other
    /// than `label`.
    fn noise_label(&self, label: usize, rng: &mut StdRng) -> u32 {
        if self.label_noise_ratio <= 0.0 || self.num_classes < 2 {
            return label as u32;
        }
        if rng.gen::<f64>() >= self.label_noise_ratio {
            return label as u32;
        }
        let mut other = rng.gen_range(0..self.num_classes - 1);
        if other >= label {
            other += 1;
        }
        other as u32
    }

    /// Move each corner by `sign * part * scale * extent / 2`, with
    /// `part` in `[0, 1)` for positives and `[1, 2)` for negatives.
    fn noise_box(&self, bbox: [f32; 4], negative: bool, rng: &mut StdRng) -> [f32; 4] {
        if self.box_noise_scale <= 0.0 {
            return bbox;
        }
        let half_w = bbox[2] as f64 * 0.5 * self.box_noise_scale;
        let half_h = bbox[3] as f64 * 0.5 * self.box_noise_scale;
        let diff = [half_w, half_h, half_w, half_h];
        let mut corners = to_corners(bbox);
        for (c, d) in corners.iter_mut().zip(diff) {
            let sign = if rng.gen::<bool>() { 1.0 } else { -1.0 };
            let mut part = rng.gen::<f64>();
            if negative {
                part += 1.0;
            }
            *c = ((*c as f64 + sign * part * d) as f32).clamp(0.0, 1.0);
        }
        to_center_size(corners)
    }
}

/// Seed of the noise stream for one image at one step.
fn stream_seed(seed: u64, step: u64, image_id: u64) -> u64 {
    let mut h = splitmix64(seed);
    h = splitmix64(h ^ step);
    splitmix64(h ^ image_id)
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
