//! Multi-head attention with grouped KV heads
//!
//! Used three ways: bidirectional encoder self-attention, incremental decoder
//! self-attention (K/V appended to the layer cache each step) and decoder
//! cross-attention over the encoder output (K/V projected once per batch).

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use crate::cache::LayerCache;
use crate::config::ModelConfig;

use super::rope::RotaryEmbedding;

/// RMSNorm computed in f32
pub struct RMSNorm {
    weight: Tensor,
    eps: f64,
}

impl RMSNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    pub fn from_tensor(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }
}

impl Module for RMSNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let input_dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let rms = (x.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?.sqrt()?;
        x.broadcast_div(&rms)?
            .broadcast_mul(&self.weight.to_dtype(DType::F32)?)?
            .to_dtype(input_dtype)
    }
}

pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    num_kv_groups: usize,
    scale: f64,
}

impl MultiHeadAttention {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();

        Ok(Self {
            q_proj: linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?,
            num_heads,
            num_kv_heads,
            head_dim,
            num_kv_groups: config.num_kv_groups(),
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// [batch, seq, heads * head_dim] -> [batch, heads, seq, head_dim]
    fn split_heads(&self, x: &Tensor, heads: usize) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;
        x.reshape((batch, seq, heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Project a memory sequence to keys/values [batch, kv_heads, seq, head_dim]
    pub fn project_kv(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let k = self.split_heads(&self.k_proj.forward(x)?, self.num_kv_heads)?;
        let v = self.split_heads(&self.v_proj.forward(x)?, self.num_kv_heads)?;
        Ok((k, v))
    }

    /// Bidirectional self-attention over the whole sequence (encoder)
    pub fn forward_full(
        &self,
        hidden_states: &Tensor,
        mask: Option<&Tensor>,
        rope: &RotaryEmbedding,
    ) -> Result<Tensor> {
        let q = self.split_heads(&self.q_proj.forward(hidden_states)?, self.num_heads)?;
        let (k, v) = self.project_kv(hidden_states)?;
        let q = rope.rotate(&q, 0)?;
        let k = rope.rotate(&k, 0)?;
        self.attend(&q, &k, &v, mask)
    }

    /// Self-attention for the newest positions only, reading and extending `cache`
    pub fn forward_incremental(
        &self,
        hidden_states: &Tensor,
        mask: Option<&Tensor>,
        rope: &RotaryEmbedding,
        offset: usize,
        cache: &mut LayerCache,
    ) -> Result<Tensor> {
        let q = self.split_heads(&self.q_proj.forward(hidden_states)?, self.num_heads)?;
        let (k, v) = self.project_kv(hidden_states)?;
        let q = rope.rotate(&q, offset)?;
        let k = rope.rotate(&k, offset)?;
        let (k, v) = cache.update(&k, &v)?;
        self.attend(&q, &k, &v, mask)
    }

    /// Attention from `hidden_states` onto precomputed memory keys/values
    pub fn forward_cross(
        &self,
        hidden_states: &Tensor,
        memory_kv: &(Tensor, Tensor),
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let q = self.split_heads(&self.q_proj.forward(hidden_states)?, self.num_heads)?;
        self.attend(&q, &memory_kv.0, &memory_kv.1, mask)
    }

    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, _, seq_len, _) = q.dims4()?;
        let k = self.repeat_kv(k)?;
        let v = self.repeat_kv(v)?;

        let weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        let weights = match mask {
            Some(mask) => weights.broadcast_add(mask)?,
            None => weights,
        };
        let weights = candle_nn::ops::softmax_last_dim(&weights.to_dtype(DType::F32)?)?
            .to_dtype(v.dtype())?;

        let output = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&output)
    }

    /// [batch, kv_heads, seq, dim] -> [batch, heads, seq, dim]
    fn repeat_kv(&self, x: &Tensor) -> Result<Tensor> {
        if self.num_kv_groups == 1 {
            return Ok(x.clone());
        }
        let (batch, kv_heads, seq_len, head_dim) = x.dims4()?;
        x.unsqueeze(2)?
            .expand((batch, kv_heads, self.num_kv_groups, seq_len, head_dim))?
            .reshape((batch, self.num_heads, seq_len, head_dim))
    }
}

/// Turn a key-validity mask [batch, 1, kv_len] (non-zero = attend) into an
/// additive mask [batch, 1, 1, kv_len] with -inf on ignored keys
pub fn additive_key_mask(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let dims = mask.dims();
    let device = mask.device();
    let keep = Tensor::zeros(dims, DType::F32, device)?;
    let drop = Tensor::full(f32::NEG_INFINITY, dims, device)?;
    mask.where_cond(&keep, &drop)?.to_dtype(dtype)?.unsqueeze(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_rms_norm_unit_weight() -> Result<()> {
        let weight = Tensor::ones(4, DType::F32, &Device::Cpu)?;
        let norm = RMSNorm::from_tensor(weight, 1e-6);
        let x = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (1, 4), &Device::Cpu)?;
        let out: Vec<f32> = norm.forward(&x)?.flatten_all()?.to_vec1()?;

        // rms([1,2,3,4]) = sqrt(7.5)
        let rms = 7.5f32.sqrt();
        for (o, x) in out.iter().zip([1.0f32, 2.0, 3.0, 4.0]) {
            assert!((o - x / rms).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_additive_key_mask() -> Result<()> {
        let mask = Tensor::from_vec(vec![1u8, 1, 0, 1, 0, 0], (2, 1, 3), &Device::Cpu)?;
        let additive = additive_key_mask(&mask, DType::F32)?;
        assert_eq!(additive.dims(), &[2, 1, 1, 3]);

        let values: Vec<f32> = additive.flatten_all()?.to_vec1()?;
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1], 0.0);
        assert!(values[2].is_infinite() && values[2] < 0.0);
        assert_eq!(values[3], 0.0);
        assert!(values[4].is_infinite() && values[5].is_infinite());
        Ok(())
    }
}
