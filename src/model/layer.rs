//! Encoder and decoder layers
//!
//! Pre-norm residual blocks:
//! - encoder: x + attn(norm(x)), then x + ffn(norm(x))
//! - decoder: adds x + cross_attn(norm(x), memory) between the two

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use crate::cache::LayerCache;
use crate::config::ModelConfig;

use super::attention::{MultiHeadAttention, RMSNorm};
use super::rope::RotaryEmbedding;

/// Gated feed-forward block: w_out(silu(w_gate(x)) * w_in(x))
pub struct FeedForward {
    w_gate: Linear,
    w_in: Linear,
    w_out: Linear,
}

impl FeedForward {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let (hidden, inner) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            w_gate: linear_no_bias(hidden, inner, vb.pp("gate_proj"))?,
            w_in: linear_no_bias(hidden, inner, vb.pp("up_proj"))?,
            w_out: linear_no_bias(inner, hidden, vb.pp("down_proj"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.w_gate.forward(x)?)?;
        self.w_out.forward(&(gate * self.w_in.forward(x)?)?)
    }
}

pub struct EncoderLayer {
    self_attn: MultiHeadAttention,
    ffn: FeedForward,
    input_layernorm: RMSNorm,
    post_attention_layernorm: RMSNorm,
}

impl EncoderLayer {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(config, vb.pp("self_attn"))?,
            ffn: FeedForward::new(config, vb.pp("mlp"))?,
            input_layernorm: RMSNorm::new(config.hidden_size, config.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: RMSNorm::new(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    /// `mask` is the additive source mask [batch, 1, 1, src_len]
    pub fn forward(&self, x: &Tensor, mask: &Tensor, rope: &RotaryEmbedding) -> Result<Tensor> {
        let h = self.input_layernorm.forward(x)?;
        let x = (x + self.self_attn.forward_full(&h, Some(mask), rope)?)?;

        let h = self.post_attention_layernorm.forward(&x)?;
        &x + self.ffn.forward(&h)?
    }
}

pub struct DecoderLayer {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    ffn: FeedForward,
    input_layernorm: RMSNorm,
    cross_attn_layernorm: RMSNorm,
    post_attention_layernorm: RMSNorm,
}

impl DecoderLayer {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let norm = |name: &str| RMSNorm::new(config.hidden_size, config.rms_norm_eps, vb.pp(name));
        Ok(Self {
            self_attn: MultiHeadAttention::new(config, vb.pp("self_attn"))?,
            cross_attn: MultiHeadAttention::new(config, vb.pp("cross_attn"))?,
            ffn: FeedForward::new(config, vb.pp("mlp"))?,
            input_layernorm: norm("input_layernorm")?,
            cross_attn_layernorm: norm("cross_attn_layernorm")?,
            post_attention_layernorm: norm("post_attention_layernorm")?,
        })
    }

    /// One incremental step.
    ///
    /// * `x` - embedded newest token(s) [batch, step_len, hidden]
    /// * `self_mask` - additive mask over the cached target prefix
    /// * `memory` - encoder output, projected into `cache` on first use
    /// * `cross_mask` - additive source mask
    pub fn forward_step(
        &self,
        x: &Tensor,
        self_mask: &Tensor,
        memory: &Tensor,
        cross_mask: &Tensor,
        rope: &RotaryEmbedding,
        offset: usize,
        cache: &mut LayerCache,
    ) -> Result<Tensor> {
        let h = self.input_layernorm.forward(x)?;
        let attn = self
            .self_attn
            .forward_incremental(&h, Some(self_mask), rope, offset, cache)?;
        let x = (x + attn)?;

        if cache.cross().is_none() {
            let (k, v) = self.cross_attn.project_kv(memory)?;
            cache.set_cross(k, v);
        }
        let h = self.cross_attn_layernorm.forward(&x)?;
        let cross = match cache.cross() {
            Some(memory_kv) => self.cross_attn.forward_cross(&h, memory_kv, Some(cross_mask))?,
            None => candle_core::bail!("cross-attention cache missing after projection"),
        };
        let x = (x + cross)?;

        let h = self.post_attention_layernorm.forward(&x)?;
        &x + self.ffn.forward(&h)?
    }
}
