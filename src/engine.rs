//! One active-learning query round
//!
//! lengths -> (model scores) -> ranking -> budget cut -> corpus mutation.
//! Scoring for the whole round completes before any corpus is touched.

use candle_core::Device;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::QueryConfig;
use crate::corpus::{Corpora, QueryOutcome};
use crate::data::InferenceDataset;
use crate::error::{Error, Result};
use crate::model::TranslationModel;
use crate::scoring::{score_batches, ActiveFunc, ScoredIndex, Strategy, UncertaintyScorer};
use crate::select::{admit, rank};
use crate::text::token_lengths;
use crate::vocab::Vocab;
use crate::weights::load_checkpoint;

/// Pool indices chosen for labeling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Admitted indices in ranking order
    pub indices: Vec<usize>,
    /// Total token length of the admitted sentences
    pub tokens: usize,
}

/// Runs query rounds under a fixed configuration
pub struct ActiveLearner {
    config: QueryConfig,
    device: Device,
}

impl ActiveLearner {
    pub fn new(config: QueryConfig) -> Result<Self> {
        config.validate()?;
        let device = Self::select_device(config.no_cuda)?;
        tracing::info!("Using device: {:?}", device);
        Ok(Self { config, device })
    }

    /// Use an explicit device instead of auto-detection
    pub fn with_device(config: QueryConfig, device: Device) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, device })
    }

    /// Best available accelerator unless `no_cuda` forces the CPU
    fn select_device(no_cuda: bool) -> Result<Device> {
        if no_cuda {
            return Ok(Device::Cpu);
        }

        #[cfg(feature = "cuda")]
        {
            if candle_core::utils::cuda_is_available() {
                return Ok(Device::new_cuda(0)?);
            }
        }

        #[cfg(feature = "metal")]
        {
            if candle_core::utils::metal_is_available() {
                return Ok(Device::new_metal(0)?);
            }
        }

        Ok(Device::Cpu)
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Full round: pick indices from `corpora.unlabeled` and move them into the labeled pairs
    pub fn run_round(
        &self,
        corpora: Corpora,
        strategy: Strategy,
        budget: usize,
    ) -> Result<(Corpora, QueryOutcome)> {
        corpora.check_aligned()?;
        let query = self.query(&corpora.unlabeled, strategy, budget)?;
        let (corpora, outcome) = corpora.apply_query(&query.indices)?;
        tracing::info!(
            "Labeled {} sentences; {} remain unlabeled, {} labeled pairs total",
            outcome.indices.len(),
            corpora.unlabeled.len(),
            corpora.labeled_src.len()
        );
        Ok((corpora, outcome))
    }

    /// Rank `pool` by `strategy` and admit a prefix within `budget` tokens.
    ///
    /// Uncertainty strategies load the configured checkpoint.
    pub fn query(&self, pool: &[String], strategy: Strategy, budget: usize) -> Result<Query> {
        let scores = match strategy {
            Strategy::Uncertainty(func) => {
                let path = self.config.checkpoint.as_ref().ok_or_else(|| {
                    Error::Config(format!("strategy {func} requires a checkpoint"))
                })?;
                let checkpoint = load_checkpoint(path, &self.device)?;
                Some(self.score_pool(
                    &checkpoint.model,
                    func,
                    &checkpoint.src_vocab,
                    &checkpoint.tgt_vocab,
                    pool,
                )?)
            }
            _ => None,
        };
        self.select(pool, strategy, budget, scores.as_deref())
    }

    /// Score every pool sentence with `model`
    pub fn score_pool<M: TranslationModel>(
        &self,
        model: &M,
        func: ActiveFunc,
        src_vocab: &Vocab,
        tgt_vocab: &Vocab,
        pool: &[String],
    ) -> Result<Vec<ScoredIndex>> {
        let max_positions = model.max_positions();
        if self.config.max_len - 1 > max_positions {
            return Err(Error::Config(format!(
                "max_len {} needs {} decoder positions but the model has {}",
                self.config.max_len,
                self.config.max_len - 1,
                max_positions
            )));
        }

        let mut dataset = InferenceDataset::new(pool, src_vocab);
        if let Some(batch_size) = self.config.batch_size {
            dataset.batch_size = batch_size;
        }
        dataset.max_batch_size = self.config.dataset_max_batch_size;
        dataset.tokens_per_batch = self.config.tokens_per_batch;

        let clipped = dataset.truncate_sources(max_positions);
        if clipped > 0 {
            tracing::warn!(
                "Clipped {} source sentences to the model's {} positions",
                clipped,
                max_positions
            );
        }

        tracing::info!(
            "Scoring {} sentences with {} (max_len={}, max_batch_size={})",
            pool.len(),
            func,
            self.config.max_len,
            self.config.max_batch_size
        );

        let scorer = UncertaintyScorer::new(model, func, src_vocab, tgt_vocab, self.config.max_len);
        let batches = dataset.iter_batches(true, true, self.config.seed, &Device::Cpu);
        let scores = score_batches(&scorer, batches, self.config.max_batch_size)?;

        if scores.len() != pool.len() {
            return Err(Error::ScoreCountMismatch {
                scores: scores.len(),
                indices: pool.len(),
            });
        }
        Ok(scores)
    }

    /// Rank and cut without touching a model
    pub fn select(
        &self,
        pool: &[String],
        strategy: Strategy,
        budget: usize,
        scores: Option<&[ScoredIndex]>,
    ) -> Result<Query> {
        let lengths = token_lengths(pool);
        let total: usize = lengths.iter().sum();
        tracing::info!(
            "Pool: {} sentences, {} tokens; strategy={}, budget={}",
            pool.len(),
            total,
            strategy,
            budget
        );

        let budget = if total < budget {
            tracing::warn!("Budget {} exceeds pool total {}; admitting everything", budget, total);
            total
        } else {
            budget
        };

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let order = rank(strategy, &lengths, scores, &mut rng)?;
        let indices = admit(&order, &lengths, budget);
        let tokens = indices.iter().map(|&i| lengths[i]).sum();

        tracing::info!("Admitted {} sentences ({} tokens)", indices.len(), tokens);
        Ok(Query { indices, tokens })
    }
}
