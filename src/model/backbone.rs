//! Encoder and decoder stacks (embedding + layers + final norm)

use candle_core::{Module, Result, Tensor};
use candle_nn::{embedding, Embedding, VarBuilder};

use crate::cache::DecodeState;
use crate::config::ModelConfig;

use super::attention::{additive_key_mask, RMSNorm};
use super::layer::{DecoderLayer, EncoderLayer};
use super::rope::RotaryEmbedding;

pub struct Encoder {
    embed_tokens: Embedding,
    layers: Vec<EncoderLayer>,
    norm: RMSNorm,
}

impl Encoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = embedding(config.src_vocab_size, config.hidden_size, vb.pp("embed_tokens"))?;
        let layers = (0..config.num_encoder_layers)
            .map(|i| EncoderLayer::new(config, vb.pp(format!("layers.{}", i))))
            .collect::<Result<Vec<_>>>()?;
        let norm = RMSNorm::new(config.hidden_size, config.rms_norm_eps, vb.pp("norm"))?;
        Ok(Self {
            embed_tokens,
            layers,
            norm,
        })
    }

    /// * `src` - source ids [batch, src_len]
    /// * `src_mask` - validity mask [batch, 1, src_len]
    ///
    /// Returns the memory [batch, src_len, hidden]
    pub fn forward(&self, src: &Tensor, src_mask: &Tensor, rope: &RotaryEmbedding) -> Result<Tensor> {
        let mut hidden_states = self.embed_tokens.forward(src)?;
        let mask = additive_key_mask(src_mask, hidden_states.dtype())?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, &mask, rope)?;
        }
        self.norm.forward(&hidden_states)
    }
}

pub struct Decoder {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RMSNorm,
}

impl Decoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = embedding(config.tgt_vocab_size, config.hidden_size, vb.pp("embed_tokens"))?;
        let layers = (0..config.num_decoder_layers)
            .map(|i| DecoderLayer::new(config, vb.pp(format!("layers.{}", i))))
            .collect::<Result<Vec<_>>>()?;
        let norm = RMSNorm::new(config.hidden_size, config.rms_norm_eps, vb.pp("norm"))?;
        Ok(Self {
            embed_tokens,
            layers,
            norm,
        })
    }

    pub fn embeddings(&self) -> &Tensor {
        self.embed_tokens.embeddings()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Decode the newest token(s) at the position held by `state`.
    ///
    /// * `tokens` - newest target ids [batch, step_len]
    /// * `tgt_mask` - validity of the target prefix including the new token [batch, 1, prefix_len]
    ///
    /// Returns decoder output [batch, step_len, hidden]. The state's length
    /// marker is left for the caller to advance.
    pub fn forward_step(
        &self,
        memory: &Tensor,
        src_mask: &Tensor,
        tokens: &Tensor,
        tgt_mask: &Tensor,
        rope: &RotaryEmbedding,
        state: &mut DecodeState,
    ) -> Result<Tensor> {
        if state.num_layers() != self.layers.len() {
            candle_core::bail!(
                "decode state has {} layers, decoder has {}",
                state.num_layers(),
                self.layers.len()
            );
        }

        let mut hidden_states = self.embed_tokens.forward(tokens)?;
        let dtype = hidden_states.dtype();
        let self_mask = additive_key_mask(tgt_mask, dtype)?;
        let cross_mask = additive_key_mask(src_mask, dtype)?;
        let offset = state.cur_len();

        for (i, layer) in self.layers.iter().enumerate() {
            let Some(cache) = state.layer_mut(i) else {
                candle_core::bail!("decode state missing layer {}", i);
            };
            hidden_states = layer.forward_step(
                &hidden_states,
                &self_mask,
                memory,
                &cross_mask,
                rope,
                offset,
                cache,
            )?;
        }

        self.norm.forward(&hidden_states)
    }
}
