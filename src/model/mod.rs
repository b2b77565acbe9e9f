//! Translation model interface and the candle encoder-decoder implementation

pub mod attention;
pub mod backbone;
pub mod layer;
pub mod rope;
pub mod seq2seq;

use candle_core::{Device, Result, Tensor};

use crate::cache::DecodeState;

pub use attention::{MultiHeadAttention, RMSNorm};
pub use backbone::{Decoder, Encoder};
pub use layer::{DecoderLayer, EncoderLayer, FeedForward};
pub use rope::RotaryEmbedding;
pub use seq2seq::Seq2SeqTransformer;

/// What the uncertainty scorer needs from a sequence-to-sequence model.
///
/// All tensors passed to one decode loop live on [`TranslationModel::device`].
pub trait TranslationModel {
    /// Encode source ids [batch, src_len] under `src_mask` [batch, 1, src_len].
    /// Called once per sub-batch.
    fn encode(&self, src: &Tensor, src_mask: &Tensor) -> Result<Tensor>;

    /// Run one decoder step on `last_token` [batch, 1].
    ///
    /// `tgt_mask` [batch, 1, cur_len] marks non-PAD positions of the generated
    /// prefix. Layer state is read from and appended to `cache`; the caller
    /// advances its length marker.
    fn decode(
        &self,
        memory: &Tensor,
        src_mask: &Tensor,
        last_token: &Tensor,
        tgt_mask: &Tensor,
        cache: &mut DecodeState,
    ) -> Result<Tensor>;

    /// Project decoder output to log-probabilities [batch, tgt_vocab] (f32)
    fn generator(&self, output: &Tensor) -> Result<Tensor>;

    fn num_decoder_layers(&self) -> usize;

    /// Longest sequence either side can position-encode; bounds both the
    /// source length and the number of decode steps
    fn max_positions(&self) -> usize {
        usize::MAX
    }

    fn device(&self) -> &Device;
}
