//! Incremental greedy decoder that scores sentences by model uncertainty
//!
//! The source is encoded once per sub-batch. Each step then feeds only the
//! newest token plus the [`DecodeState`], so per-step cost does not grow with
//! the generated prefix. Per-sentence bookkeeping (finished flags, lengths,
//! running scores, hypotheses) stays on the host; only the logits and the
//! reductions over them run on the model's device.

use candle_core::{Result, Tensor, D};

use crate::cache::DecodeState;
use crate::model::TranslationModel;
use crate::text::detokenize;
use crate::vocab::Vocab;

use super::active::ActiveFunc;

/// Uncertainty score paired with the sentence's pool index
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredIndex {
    pub score: f64,
    pub index: usize,
}

/// Greedy decode result for one sentence
#[derive(Debug, Clone)]
pub struct Hypothesis {
    /// Pool index of the source sentence
    pub index: usize,
    /// Stored output positions up to the last decoded step, starting with BOS
    pub tokens: Vec<u32>,
    /// BOS plus every token emitted before (and including) EOS
    pub gen_len: usize,
    /// Final score, length-normalised unless the function is `tte`
    pub score: f64,
    /// Generation hit `max_len` and EOS was forced into the last position
    pub truncated: bool,
}

impl Hypothesis {
    pub fn scored_index(&self) -> ScoredIndex {
        ScoredIndex {
            score: self.score,
            index: self.index,
        }
    }

    /// Generated tokens up to `gen_len`
    pub fn generated(&self) -> &[u32] {
        &self.tokens[..self.gen_len.min(self.tokens.len())]
    }
}

/// Scores sub-batches with one model and one uncertainty function
pub struct UncertaintyScorer<'a, M: TranslationModel> {
    model: &'a M,
    active_func: ActiveFunc,
    src_vocab: &'a Vocab,
    tgt_vocab: &'a Vocab,
    max_len: usize,
}

impl<'a, M: TranslationModel> UncertaintyScorer<'a, M> {
    pub fn new(
        model: &'a M,
        active_func: ActiveFunc,
        src_vocab: &'a Vocab,
        tgt_vocab: &'a Vocab,
        max_len: usize,
    ) -> Self {
        Self {
            model,
            active_func,
            src_vocab,
            tgt_vocab,
            max_len,
        }
    }

    pub fn model(&self) -> &M {
        self.model
    }

    pub fn src_vocab(&self) -> &Vocab {
        self.src_vocab
    }

    pub fn active_func(&self) -> ActiveFunc {
        self.active_func
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Decode one sub-batch and score every row.
    ///
    /// * `src` - source ids [batch, src_len] on the model's device
    /// * `src_mask` - [batch, 1, src_len], non-zero on non-PAD positions
    /// * `indices` - pool index of each row
    pub fn score_batch(&self, src: &Tensor, src_mask: &Tensor, indices: &[usize]) -> Result<Vec<Hypothesis>> {
        let bsz = src.dim(0)?;
        if bsz != indices.len() {
            candle_core::bail!("sub-batch has {} rows but {} indices", bsz, indices.len());
        }
        if self.max_len < 2 {
            candle_core::bail!("max_len must be at least 2, got {}", self.max_len);
        }
        // Steps feed positions 0..max_len-1
        let max_positions = self.model.max_positions();
        if self.max_len - 1 > max_positions {
            candle_core::bail!(
                "max_len {} needs {} decoder positions, model has {}",
                self.max_len,
                self.max_len - 1,
                max_positions
            );
        }
        if src.dim(1)? > max_positions {
            candle_core::bail!(
                "source length {} exceeds model positions {}",
                src.dim(1)?,
                max_positions
            );
        }

        let device = self.model.device();
        if !src.device().same_device(device) || !src_mask.device().same_device(device) {
            candle_core::bail!("sub-batch tensors are not on the model device");
        }

        let pad = self.tgt_vocab.pad_id();
        let bos = self.tgt_vocab.bos_id();
        let eos = self.tgt_vocab.eos_id();
        let max_len = self.max_len;

        let memory = self.model.encode(src, src_mask)?;

        let mut generated = vec![vec![pad; max_len]; bsz];
        for row in generated.iter_mut() {
            row[0] = bos;
        }
        let mut cache = DecodeState::new(self.model.num_decoder_layers());
        let mut unfinished = vec![true; bsz];
        let mut gen_len = vec![1usize; bsz];
        let mut scores = vec![0f64; bsz];

        let mut cur_len = 1;
        while cur_len < max_len {
            let last: Vec<u32> = generated.iter().map(|row| row[cur_len - 1]).collect();
            let last = Tensor::from_vec(last, (bsz, 1), device)?;

            // Non-PAD positions of the prefix decoded so far
            let prefix_mask: Vec<u8> = generated
                .iter()
                .flat_map(|row| row[..cur_len].iter().map(|&t| u8::from(t != pad)))
                .collect();
            let tgt_mask = Tensor::from_vec(prefix_mask, (bsz, 1, cur_len), device)?;

            let output = self.model.decode(&memory, src_mask, &last, &tgt_mask, &mut cache)?;
            let log_probs = self.model.generator(&output)?;

            let contribution: Vec<f32> = self
                .active_func
                .step_contribution(&log_probs)?
                .reshape(bsz)?
                .to_vec1()?;
            let next_words: Vec<u32> = log_probs.argmax(D::Minus1)?.reshape(bsz)?.to_vec1()?;

            for i in 0..bsz {
                if unfinished[i] {
                    scores[i] += f64::from(contribution[i]);
                    generated[i][cur_len] = next_words[i];
                    gen_len[i] += 1;
                    if next_words[i] == eos {
                        unfinished[i] = false;
                    }
                } else {
                    generated[i][cur_len] = pad;
                }
            }

            cur_len += 1;
            cache.advance();

            if unfinished.iter().all(|u| !u) {
                break;
            }
        }

        if cur_len == max_len {
            for (row, &open) in generated.iter_mut().zip(&unfinished) {
                if open {
                    row[max_len - 1] = eos;
                }
            }
        }

        let normalize = self.active_func.normalize_by_length();
        let hypotheses: Vec<Hypothesis> = (0..bsz)
            .map(|i| {
                let score = if normalize {
                    scores[i] / gen_len[i] as f64
                } else {
                    scores[i]
                };
                let mut tokens = std::mem::take(&mut generated[i]);
                tokens.truncate(cur_len);
                Hypothesis {
                    index: indices[i],
                    tokens,
                    gen_len: gen_len[i],
                    score,
                    truncated: unfinished[i],
                }
            })
            .collect();

        if tracing::enabled!(tracing::Level::DEBUG) {
            self.log_hypotheses(src, &hypotheses)?;
        }

        Ok(hypotheses)
    }

    /// Emit "S: ..." / "H: ..." pairs for auditing
    fn log_hypotheses(&self, src: &Tensor, hypotheses: &[Hypothesis]) -> Result<()> {
        let src_rows: Vec<Vec<u32>> = src.to_vec2()?;
        for (src_ids, hyp) in src_rows.iter().zip(hypotheses) {
            let src_sent = detokenize(&self.src_vocab.decode(src_ids));
            let hyp_sent = detokenize(&self.tgt_vocab.decode(hyp.generated()));
            tracing::debug!("S: {}", src_sent);
            tracing::debug!("H: {}", hyp_sent);
        }
        Ok(())
    }
}
