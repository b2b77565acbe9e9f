//! Rotary position embeddings
//!
//! inv_freq[i] = theta^(-2i / head_dim), rotation applied to the
//! concatenated halves of each head (`rotate_half` convention).

use candle_core::{DType, Device, Result, Tensor, D};

/// Precomputed cos/sin tables for positions `0..max_seq_len`
pub struct RotaryEmbedding {
    max_seq_len: usize,
    /// [max_seq_len, head_dim]
    cos: Tensor,
    /// [max_seq_len, head_dim]
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf((2 * i) as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (max_seq_len, 1), device)?;

        // [max_seq_len, half_dim] -> [max_seq_len, head_dim]
        let freqs = positions.matmul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            max_seq_len,
            cos: emb.cos()?,
            sin: emb.sin()?,
        })
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Rotate `x` [batch, heads, seq, head_dim] whose first row sits at absolute position `offset`
    pub fn rotate(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let seq_len = x.dim(2)?;
        if offset + seq_len > self.max_seq_len {
            candle_core::bail!(
                "position {} + {} exceeds rotary table of {}",
                offset,
                seq_len,
                self.max_seq_len
            );
        }

        let cos = self.cos.narrow(0, offset, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.sin.narrow(0, offset, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;

        // Rotation runs in f32 regardless of parameter dtype
        let input_dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let rotated = (x.broadcast_mul(&cos)? + rotate_half(&x)?.broadcast_mul(&sin)?)?;
        rotated.to_dtype(input_dtype)
    }
}

/// (x1, x2) -> (-x2, x1) over the last dimension
fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_half() -> Result<()> {
        let x = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (1, 1, 1, 4), &Device::Cpu)?;
        let result: Vec<f32> = rotate_half(&x)?.flatten_all()?.to_vec1()?;
        assert_eq!(result, vec![-3.0, -4.0, 1.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_position_zero_is_identity() -> Result<()> {
        let rope = RotaryEmbedding::new(4, 8, 10_000.0, &Device::Cpu)?;
        let x = Tensor::from_vec(vec![0.5f32, -1.0, 2.0, 3.0], (1, 1, 1, 4), &Device::Cpu)?;
        let out: Vec<f32> = rope.rotate(&x, 0)?.flatten_all()?.to_vec1()?;
        for (a, b) in out.iter().zip([0.5f32, -1.0, 2.0, 3.0]) {
            assert!((a - b).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_offset_past_table_fails() -> Result<()> {
        let rope = RotaryEmbedding::new(4, 8, 10_000.0, &Device::Cpu)?;
        let x = Tensor::zeros((1, 1, 2, 4), DType::F32, &Device::Cpu)?;
        assert!(rope.rotate(&x, 7).is_err());
        assert!(rope.rotate(&x, 6).is_ok());
        Ok(())
    }
}
