//! Inference dataset over raw unlabeled sentences
//!
//! Tokenizes each sentence through the source vocabulary (appending EOS),
//! groups rows into padded batches and remembers every row's pool index.

use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::batch::Batch;
use crate::vocab::Vocab;

/// Default sentences per batch when batching by count
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Tokenized unlabeled pool with batching knobs
pub struct InferenceDataset {
    sentences: Vec<Vec<u32>>,
    pad_id: u32,
    eos_id: u32,
    /// Sentences per batch (used when `tokens_per_batch` is unset)
    pub batch_size: usize,
    /// Cap on sentences per batch when batching by tokens
    pub max_batch_size: Option<usize>,
    /// Padded token budget per batch; switches to token-based batching when set
    pub tokens_per_batch: Option<usize>,
}

impl InferenceDataset {
    pub fn new<S: AsRef<str>>(sentences: &[S], vocab: &Vocab) -> Self {
        let sentences = sentences
            .iter()
            .map(|s| {
                let mut ids = vocab.encode(s.as_ref());
                ids.push(vocab.eos_id());
                ids
            })
            .collect();
        Self {
            sentences,
            pad_id: vocab.pad_id(),
            eos_id: vocab.eos_id(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_batch_size: None,
            tokens_per_batch: None,
        }
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    /// Encoded length (including EOS) of sentence `idx`
    pub fn sentence_len(&self, idx: usize) -> usize {
        self.sentences[idx].len()
    }

    /// Clip every encoded sentence to at most `max_tokens` ids, keeping EOS
    /// as the final id. Returns how many sentences were clipped.
    pub fn truncate_sources(&mut self, max_tokens: usize) -> usize {
        let max_tokens = max_tokens.max(1);
        let mut clipped = 0;
        for ids in self.sentences.iter_mut().filter(|ids| ids.len() > max_tokens) {
            ids.truncate(max_tokens - 1);
            ids.push(self.eos_id);
            clipped += 1;
        }
        clipped
    }

    /// Partition pool indices into batches.
    ///
    /// `group_by_size` orders rows by encoded length first so batches carry
    /// little padding; `shuffle` permutes rows (when not grouping) and the
    /// order of batches.
    pub fn batch_indices(&self, shuffle: bool, group_by_size: bool, rng: &mut StdRng) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.sentences.len()).collect();
        if group_by_size {
            order.sort_by_key(|&i| self.sentences[i].len());
        } else if shuffle {
            order.shuffle(rng);
        }

        let mut batches: Vec<Vec<usize>> = Vec::new();
        let mut current: Vec<usize> = Vec::new();
        let mut current_max = 0usize;

        for idx in order {
            let len = self.sentences[idx].len();
            if !current.is_empty() && self.would_overflow(current.len() + 1, current_max.max(len)) {
                batches.push(std::mem::take(&mut current));
                current_max = 0;
            }
            current_max = current_max.max(len);
            current.push(idx);
        }
        if !current.is_empty() {
            batches.push(current);
        }

        if shuffle {
            batches.shuffle(rng);
        }
        batches
    }

    fn would_overflow(&self, rows: usize, max_len: usize) -> bool {
        match self.tokens_per_batch {
            Some(tokens) => {
                rows * max_len > tokens || self.max_batch_size.is_some_and(|cap| rows > cap)
            }
            None => rows > self.batch_size,
        }
    }

    /// Build the padded [rows, max_len] tensor for one group of pool indices
    pub fn make_batch(&self, indices: Vec<usize>, device: &Device) -> Result<Batch> {
        let width = indices
            .iter()
            .map(|&i| self.sentences[i].len())
            .max()
            .unwrap_or(0);
        let mut data = vec![self.pad_id; indices.len() * width];
        for (row, &idx) in indices.iter().enumerate() {
            let ids = &self.sentences[idx];
            data[row * width..row * width + ids.len()].copy_from_slice(ids);
        }
        let src = Tensor::from_vec(data, (indices.len(), width), device)?;
        Batch::new(src, indices)
    }

    /// Iterate over padded batches on `device`
    pub fn iter_batches<'a>(
        &'a self,
        shuffle: bool,
        group_by_size: bool,
        seed: Option<u64>,
        device: &'a Device,
    ) -> impl Iterator<Item = Result<Batch>> + 'a {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        self.batch_indices(shuffle, group_by_size, &mut rng)
            .into_iter()
            .map(move |indices| self.make_batch(indices, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocab {
        let tokens = ["<pad>", "<unk>", "<s>", "</s>", "a", "b", "c"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Vocab::from_tokens(tokens).unwrap()
    }

    fn pool() -> Vec<String> {
        ["a b c", "a", "b c", "c c c c", "a b", ""]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_batches_cover_pool_once() {
        let pool = pool();
        let mut ds = InferenceDataset::new(&pool, &vocab());
        ds.batch_size = 4;
        let mut rng = StdRng::seed_from_u64(7);
        let batches = ds.batch_indices(true, true, &mut rng);

        let mut seen: Vec<usize> = batches.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..pool.len()).collect::<Vec<_>>());
        assert!(batches.iter().all(|b| b.len() <= 4));
    }

    #[test]
    fn test_tokens_per_batch_bound() {
        let pool = pool();
        let mut ds = InferenceDataset::new(&pool, &vocab());
        ds.tokens_per_batch = Some(6);
        ds.max_batch_size = Some(2);
        let mut rng = StdRng::seed_from_u64(0);

        for batch in ds.batch_indices(false, true, &mut rng) {
            let width = batch.iter().map(|&i| ds.sentence_len(i)).max().unwrap();
            assert!(batch.len() <= 2);
            assert!(batch.len() == 1 || batch.len() * width <= 6);
        }
    }

    #[test]
    fn test_make_batch_pads_and_appends_eos() -> Result<()> {
        let pool = pool();
        let ds = InferenceDataset::new(&pool, &vocab());
        let batch = ds.make_batch(vec![1, 0], &Device::Cpu)?;

        assert_eq!(batch.indices, vec![1, 0]);
        let rows: Vec<Vec<u32>> = batch.src.to_vec2()?;
        assert_eq!(rows[0], vec![4, 3, 0, 0]);
        assert_eq!(rows[1], vec![4, 5, 6, 3]);
        Ok(())
    }

    #[test]
    fn test_truncate_sources_keeps_eos() -> Result<()> {
        let pool = pool();
        let mut ds = InferenceDataset::new(&pool, &vocab());

        // "a b c" and "c c c c" exceed 3 ids with EOS
        assert_eq!(ds.truncate_sources(3), 2);
        assert!((0..ds.len()).all(|i| ds.sentence_len(i) <= 3));

        let rows: Vec<Vec<u32>> = ds.make_batch(vec![0, 3, 1], &Device::Cpu)?.src.to_vec2()?;
        assert_eq!(rows[0], vec![4, 5, 3]);
        assert_eq!(rows[1], vec![6, 6, 3]);
        assert_eq!(rows[2], vec![4, 3, 0]);

        assert_eq!(ds.truncate_sources(3), 0);
        Ok(())
    }
}
