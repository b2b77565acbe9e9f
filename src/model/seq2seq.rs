//! Encoder-decoder translation transformer with a log-softmax generator

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use crate::cache::DecodeState;
use crate::config::ModelConfig;

use super::backbone::{Decoder, Encoder};
use super::rope::RotaryEmbedding;
use super::TranslationModel;

pub struct Seq2SeqTransformer {
    encoder: Encoder,
    decoder: Decoder,
    /// Output projection: [hidden_size -> tgt_vocab_size]
    proj: Linear,
    rope: RotaryEmbedding,
    config: ModelConfig,
    device: Device,
}

impl Seq2SeqTransformer {
    pub fn new(config: &ModelConfig, vb: VarBuilder, device: &Device) -> Result<Self> {
        let encoder = Encoder::new(config, vb.pp("encoder"))?;
        let decoder = Decoder::new(config, vb.pp("decoder"))?;

        let proj = if config.tie_word_embeddings {
            Linear::new(decoder.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.tgt_vocab_size, vb.pp("generator.proj"))?
        };

        let rope = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            device,
        )?;

        Ok(Self {
            encoder,
            decoder,
            proj,
            rope,
            config: config.clone(),
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

impl TranslationModel for Seq2SeqTransformer {
    fn encode(&self, src: &Tensor, src_mask: &Tensor) -> Result<Tensor> {
        self.encoder.forward(src, src_mask, &self.rope)
    }

    fn decode(
        &self,
        memory: &Tensor,
        src_mask: &Tensor,
        last_token: &Tensor,
        tgt_mask: &Tensor,
        cache: &mut DecodeState,
    ) -> Result<Tensor> {
        self.decoder
            .forward_step(memory, src_mask, last_token, tgt_mask, &self.rope, cache)
    }

    fn generator(&self, output: &Tensor) -> Result<Tensor> {
        // Only the newest position matters: [batch, step_len, hidden] -> [batch, hidden]
        let output = match output.rank() {
            3 => {
                let step_len = output.dim(1)?;
                output.narrow(1, step_len - 1, 1)?.squeeze(1)?
            }
            _ => output.clone(),
        };
        let logits = self.proj.forward(&output)?.to_dtype(DType::F32)?;
        candle_nn::ops::log_softmax(&logits, D::Minus1)
    }

    fn num_decoder_layers(&self) -> usize {
        self.decoder.num_layers()
    }

    fn max_positions(&self) -> usize {
        self.rope.max_seq_len()
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
