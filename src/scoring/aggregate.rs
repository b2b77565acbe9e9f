//! Drives the scorer across every batch of an inference iterator

use candle_core::{DType, Result, Tensor};

use crate::batch::{split_batch, Batch};
use crate::model::TranslationModel;

use super::scorer::{ScoredIndex, UncertaintyScorer};

/// Score every batch yielded by `batches`, splitting any batch larger than
/// `max_batch_size`. Results are concatenated in presentation order.
///
/// Panics if a sub-batch's result count differs from its index count; that
/// can only happen through a bug in the splitter or scorer.
pub fn score_batches<M, I>(
    scorer: &UncertaintyScorer<'_, M>,
    batches: I,
    max_batch_size: usize,
) -> Result<Vec<ScoredIndex>>
where
    M: TranslationModel,
    I: IntoIterator<Item = Result<Batch>>,
{
    let device = scorer.model().device().clone();
    let pad = scorer.src_vocab().pad_id();
    let mut results = Vec::new();

    for batch in batches {
        let split = split_batch(batch?, max_batch_size)?;
        if split.was_split() {
            tracing::debug!("Split batch into {} sub-batches", split.len());
        }

        for chunk in split {
            assert_eq!(chunk.src.dim(0)?, chunk.indices.len(), "sub-batch rows and indices diverged");
            tracing::debug!("Scoring sub-batch of {} sentences", chunk.len());

            let src = chunk.src.to_device(&device)?;
            let src_mask = source_mask(&src, pad)?;

            let hypotheses = scorer.score_batch(&src, &src_mask, &chunk.indices)?;
            assert_eq!(
                hypotheses.len(),
                chunk.indices.len(),
                "scorer returned a different number of results than indices"
            );
            results.extend(hypotheses.iter().map(|h| h.scored_index()));
        }
    }

    Ok(results)
}

/// [batch, src_len] ids -> [batch, 1, src_len] mask, 1 on non-PAD positions
pub fn source_mask(src: &Tensor, pad_id: u32) -> Result<Tensor> {
    src.ne(pad_id)?.to_dtype(DType::U8)?.unsqueeze(1)
}
