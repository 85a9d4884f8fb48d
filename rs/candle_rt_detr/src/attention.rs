//! Masked multi-head self-attention
//!
//! The decoder's query self-attention, with an optional additive mask. The
//! denoising isolation mask is applied here: blocked pairs get `-inf` before
//! the softmax, so their weight is exactly zero.

use candle_core::{Result, Tensor, D};
use candle_nn::{init, linear, Init, Linear, Module, VarBuilder};

/// Multi-head attention with a combined QKV projection.
pub struct MultiheadAttention {
    num_heads: usize,
    head_dim: usize,
    /// Combined QKV projection
    in_proj_weight: Tensor,
    in_proj_bias: Tensor,
    /// Output projection
    out_proj: Linear,
}

impl MultiheadAttention {
    /// Load from weights (or initialize, when `vb` is backed by a `VarMap`).
    pub fn load(embed_dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            candle_core::bail!(
                "embed_dim {} is not divisible by num_heads {}",
                embed_dim,
                num_heads
            );
        }
        let head_dim = embed_dim / num_heads;

        let in_proj_weight = vb.get_with_hints(
            (3 * embed_dim, embed_dim),
            "in_proj_weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let in_proj_bias = vb.get_with_hints(3 * embed_dim, "in_proj_bias", Init::Const(0.0))?;
        let out_proj = linear(embed_dim, embed_dim, vb.pp("out_proj"))?;

        Ok(Self {
            num_heads,
            head_dim,
            in_proj_weight,
            in_proj_bias,
            out_proj,
        })
    }

    fn project(&self, x: &Tensor, part: usize) -> Result<Tensor> {
        let embed_dim = self.num_heads * self.head_dim;
        let (batch_size, seq_len, _) = x.dims3()?;
        x.broadcast_matmul(&self.in_proj_weight.narrow(0, part * embed_dim, embed_dim)?.t()?)?
            .broadcast_add(&self.in_proj_bias.narrow(0, part * embed_dim, embed_dim)?)?
            // [batch, seq, embed] -> [batch, heads, seq, head_dim]
            .reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `query` - Query tensor [batch_size, tgt_len, embed_dim]
    /// * `key` - Key tensor [batch_size, src_len, embed_dim]
    /// * `value` - Value tensor [batch_size, src_len, embed_dim]
    /// * `attn_mask` - Optional additive mask [tgt_len, src_len]
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch_size, tgt_len, embed_dim) = query.dims3()?;

        let q = self.project(query, 0)?;
        let k = self.project(key, 1)?;
        let v = self.project(value, 2)?;

        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let mut attn_weights = (q.matmul(&k_t)? / scale)?;
        if let Some(mask) = attn_mask {
            attn_weights = attn_weights.broadcast_add(&mask.to_dtype(attn_weights.dtype())?)?;
        }
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        // [batch, heads, seq, head_dim] -> [batch, seq, embed]
        let attn_output = attn_output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, tgt_len, embed_dim))?;

        self.out_proj.forward(&attn_output)
    }
}
