//! Detection model interface
//!
//! Backbone, hybrid encoder and decoder live outside this crate. They are
//! consumed through [`DetectionModel`]: an image batch (plus, in training,
//! the prepared denoising queries and isolation mask) goes in, per-layer
//! `(logits, boxes)` come out.

use candle_core::Tensor;

use crate::criterion::LayerOutput;
use crate::denoising::DenoisingQueries;
use crate::error::Result;

/// Raw outputs of one forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutputs {
    /// One entry per decoder layer, final layer last. With denoising queries
    /// each layer holds `num_denoising + num_queries` slots, denoising first.
    pub decoder: Vec<LayerOutput>,
    /// Encoder proposal heads scored like auxiliary layers (may be empty)
    pub encoder: Vec<LayerOutput>,
}

pub trait DetectionModel {
    /// Classification channels of the heads
    fn num_classes(&self) -> usize;

    fn hidden_dim(&self) -> usize;

    /// Learned object queries per image
    fn num_queries(&self) -> usize;

    /// Run backbone, encoder and decoder on `images [B, 3, H, W]`.
    ///
    /// When `denoising` is given, its queries are prepended to the learned
    /// queries and `denoising.attn_mask` is applied in decoder self-attention.
    fn forward(
        &self,
        images: &Tensor,
        denoising: Option<&DenoisingQueries>,
    ) -> Result<ModelOutputs>;
}
