//! Decode-loop tests against a scripted model
//!
//! The scripted model ignores its inputs and returns a fixed probability
//! distribution per (row, step), so expected scores can be computed by hand.

use std::cell::RefCell;

use candle_core::{Device, Result, Tensor};

use active_nmt_rs::batch::Batch;
use active_nmt_rs::cache::DecodeState;
use active_nmt_rs::model::TranslationModel;
use active_nmt_rs::scoring::{score_batches, source_mask, ActiveFunc, UncertaintyScorer};
use active_nmt_rs::vocab::Vocab;

const PAD: u32 = 0;
const BOS: u32 = 2;
const EOS: u32 = 3;
const X: u32 = 4;
const Y: u32 = 5;

// Argmax x
const P_X: [f32; 6] = [0.05, 0.05, 0.05, 0.15, 0.6, 0.1];
// Argmax EOS
const P_EOS: [f32; 6] = [0.02, 0.02, 0.02, 0.8, 0.1, 0.04];
// Argmax y
const P_Y: [f32; 6] = [0.05, 0.05, 0.05, 0.1, 0.15, 0.6];

fn vocab(extra: &[&str]) -> Vocab {
    let tokens = ["<pad>", "<unk>", "<s>", "</s>"]
        .iter()
        .chain(extra)
        .map(|s| s.to_string())
        .collect();
    Vocab::from_tokens(tokens).unwrap()
}

/// Row `i` emits `script[i][step]`; past the end of a row's script the last
/// entry repeats. Rows beyond the script reuse the last row.
struct ScriptedModel {
    script: Vec<Vec<[f32; 6]>>,
    device: Device,
    encoded_rows: RefCell<Vec<usize>>,
    tgt_masks: RefCell<Vec<Vec<Vec<u8>>>>,
}

impl ScriptedModel {
    fn new(script: Vec<Vec<[f32; 6]>>) -> Self {
        Self {
            script,
            device: Device::Cpu,
            encoded_rows: RefCell::new(Vec::new()),
            tgt_masks: RefCell::new(Vec::new()),
        }
    }

    fn probs(&self, row: usize, step: usize) -> [f32; 6] {
        let steps = &self.script[row.min(self.script.len() - 1)];
        steps[step.min(steps.len() - 1)]
    }
}

impl TranslationModel for ScriptedModel {
    fn encode(&self, src: &Tensor, _src_mask: &Tensor) -> Result<Tensor> {
        self.encoded_rows.borrow_mut().push(src.dim(0)?);
        Tensor::zeros((src.dim(0)?, src.dim(1)?, 4), candle_core::DType::F32, &self.device)
    }

    fn decode(
        &self,
        _memory: &Tensor,
        _src_mask: &Tensor,
        last_token: &Tensor,
        tgt_mask: &Tensor,
        cache: &mut DecodeState,
    ) -> Result<Tensor> {
        let bsz = last_token.dim(0)?;
        assert_eq!(last_token.dims(), &[bsz, 1]);
        // The prefix mask always covers exactly the positions fed so far
        assert_eq!(tgt_mask.dims(), &[bsz, 1, cache.cur_len() + 1]);
        self.tgt_masks.borrow_mut().push(tgt_mask.squeeze(1)?.to_vec2()?);

        let step = cache.cur_len();
        let log_probs: Vec<f32> = (0..bsz)
            .flat_map(|row| self.probs(row, step).map(f32::ln))
            .collect();
        Tensor::from_vec(log_probs, (bsz, 1, 6), &self.device)
    }

    fn generator(&self, output: &Tensor) -> Result<Tensor> {
        output.squeeze(1)
    }

    fn num_decoder_layers(&self) -> usize {
        1
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

fn neg_entropy(p: &[f32; 6]) -> f64 {
    p.iter().map(|&x| f64::from(x) * f64::from(x).ln()).sum()
}

fn top_two(p: &[f32; 6]) -> (f64, f64) {
    let mut sorted: Vec<f64> = p.iter().map(|&x| f64::from(x)).collect();
    sorted.sort_by(|a, b| b.total_cmp(a));
    (sorted[0], sorted[1])
}

fn source(rows: usize) -> Result<(Tensor, Tensor)> {
    let src = Tensor::from_vec(vec![X; rows * 2], (rows, 2), &Device::Cpu)?;
    let mask = source_mask(&src, PAD)?;
    Ok((src, mask))
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-5,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn test_eos_at_second_step_scores_two_steps() -> Result<()> {
    let src_vocab = vocab(&["a"]);
    let tgt_vocab = vocab(&["x", "y"]);
    let model = ScriptedModel::new(vec![vec![P_X, P_EOS]]);
    let (src, mask) = source(1)?;

    let tte = UncertaintyScorer::new(&model, ActiveFunc::TotalTokenEntropy, &src_vocab, &tgt_vocab, 5)
        .score_batch(&src, &mask, &[7])?;
    let te = UncertaintyScorer::new(&model, ActiveFunc::TokenEntropy, &src_vocab, &tgt_vocab, 5)
        .score_batch(&src, &mask, &[7])?;

    let hyp = &tte[0];
    assert_eq!(hyp.index, 7);
    assert_eq!(hyp.gen_len, 3);
    assert_eq!(hyp.generated(), &[BOS, X, EOS]);
    assert_eq!(hyp.tokens.len(), 3);
    assert!(!hyp.truncated);

    let expected = neg_entropy(&P_X) + neg_entropy(&P_EOS);
    assert_close(hyp.score, expected);
    assert_close(te[0].score, expected / 3.0);
    Ok(())
}

#[test]
fn test_lc_and_margin_are_length_normalised() -> Result<()> {
    let src_vocab = vocab(&["a"]);
    let tgt_vocab = vocab(&["x", "y"]);
    let model = ScriptedModel::new(vec![vec![P_X, P_EOS]]);
    let (src, mask) = source(1)?;

    let lc = UncertaintyScorer::new(&model, ActiveFunc::LeastConfidence, &src_vocab, &tgt_vocab, 250)
        .score_batch(&src, &mask, &[0])?;
    let margin = UncertaintyScorer::new(&model, ActiveFunc::Margin, &src_vocab, &tgt_vocab, 250)
        .score_batch(&src, &mask, &[0])?;

    let (x1, x2) = top_two(&P_X);
    let (e1, e2) = top_two(&P_EOS);
    assert_close(lc[0].score, ((x1 - 1.0) + (e1 - 1.0)) / 3.0);
    assert_close(margin[0].score, ((x1 - x2) + (e1 - e2)) / 3.0);
    Ok(())
}

#[test]
fn test_all_finish_immediately_stops_after_one_step() -> Result<()> {
    let src_vocab = vocab(&["a"]);
    let tgt_vocab = vocab(&["x", "y"]);
    let model = ScriptedModel::new(vec![vec![P_EOS]]);
    let (src, mask) = source(3)?;

    let scorer = UncertaintyScorer::new(&model, ActiveFunc::TokenEntropy, &src_vocab, &tgt_vocab, 250);
    let hyps = scorer.score_batch(&src, &mask, &[0, 1, 2])?;

    assert_eq!(model.tgt_masks.borrow().len(), 1);
    for hyp in &hyps {
        assert_eq!(hyp.gen_len, 2);
        assert_eq!(hyp.tokens, vec![BOS, EOS]);
        assert_close(hyp.score, neg_entropy(&P_EOS) / 2.0);
    }
    Ok(())
}

#[test]
fn test_mixed_batch_padding_and_truncation() -> Result<()> {
    let src_vocab = vocab(&["a"]);
    let tgt_vocab = vocab(&["x", "y"]);
    let model = ScriptedModel::new(vec![vec![P_X, P_EOS], vec![P_EOS], vec![P_Y]]);
    let (src, mask) = source(3)?;

    let scorer = UncertaintyScorer::new(&model, ActiveFunc::TotalTokenEntropy, &src_vocab, &tgt_vocab, 5);
    let hyps = scorer.score_batch(&src, &mask, &[10, 11, 12])?;

    // Row 2 never emits EOS, so the loop runs until max_len
    assert_eq!(model.tgt_masks.borrow().len(), 4);

    assert_eq!(hyps[0].tokens, vec![BOS, X, EOS, PAD, PAD]);
    assert_eq!(hyps[1].tokens, vec![BOS, EOS, PAD, PAD, PAD]);
    assert_eq!(hyps[2].tokens, vec![BOS, Y, Y, Y, EOS]);

    assert_eq!(hyps[0].gen_len, 3);
    assert_eq!(hyps[1].gen_len, 2);
    assert_eq!(hyps[2].gen_len, 5);
    assert!(hyps[2].truncated);
    assert!(!hyps[0].truncated && !hyps[1].truncated);

    // Finished rows stop accumulating even though the model keeps scoring them
    assert_close(hyps[1].score, neg_entropy(&P_EOS));
    assert_close(hyps[2].score, 4.0 * neg_entropy(&P_Y));

    // PAD emitted after EOS is masked out of later prefixes
    let masks = model.tgt_masks.borrow();
    assert_eq!(masks[3][1], vec![1, 1, 0, 0]);
    assert_eq!(masks[3][2], vec![1, 1, 1, 1]);
    Ok(())
}

#[test]
fn test_index_count_mismatch_is_rejected() -> Result<()> {
    let src_vocab = vocab(&["a"]);
    let tgt_vocab = vocab(&["x", "y"]);
    let model = ScriptedModel::new(vec![vec![P_EOS]]);
    let (src, mask) = source(2)?;

    let scorer = UncertaintyScorer::new(&model, ActiveFunc::Margin, &src_vocab, &tgt_vocab, 250);
    assert!(scorer.score_batch(&src, &mask, &[0]).is_err());
    Ok(())
}

#[test]
fn test_oversized_batch_is_split_and_fully_scored() -> Result<()> {
    let src_vocab = vocab(&["a"]);
    let tgt_vocab = vocab(&["x", "y"]);
    let model = ScriptedModel::new(vec![vec![P_X, P_EOS]]);

    let rows = 1000;
    let (src, _) = source(rows)?;
    let indices: Vec<usize> = (0..rows).rev().collect();
    let batch = Batch::new(src, indices.clone())?;

    let scorer = UncertaintyScorer::new(&model, ActiveFunc::TokenEntropy, &src_vocab, &tgt_vocab, 250);
    let scores = score_batches(&scorer, vec![Ok(batch)], 800)?;

    assert_eq!(*model.encoded_rows.borrow(), vec![800, 200]);
    assert_eq!(scores.len(), rows);
    let scored: Vec<usize> = scores.iter().map(|s| s.index).collect();
    assert_eq!(scored, indices);
    Ok(())
}
