//! active-nmt CLI
//!
//! Runs one query round over file-based corpora and writes the updated
//! unlabeled, labeled and oracle files.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use active_nmt_rs::{ActiveLearner, Corpora, QueryConfig, Strategy};

/// Parse "src_path,tgt_path"
fn parse_path_pair(value: &str) -> std::result::Result<(PathBuf, PathBuf), String> {
    match value.split_once(',') {
        Some((src, tgt)) if !src.is_empty() && !tgt.is_empty() && !tgt.contains(',') => {
            Ok((PathBuf::from(src), PathBuf::from(tgt)))
        }
        _ => Err(format!("expected 'src_path,tgt_path', got '{value}'")),
    }
}

#[derive(Parser)]
#[command(name = "active-nmt")]
#[command(about = "Select unlabeled sentences for labeling under a token budget", long_about = None)]
struct Cli {
    /// Unlabeled source corpus
    #[arg(short = 'U', long)]
    unlabeled_dataset: PathBuf,

    /// Labeled corpus as "src,tgt"
    #[arg(short = 'L', long, value_parser = parse_path_pair)]
    labeled_dataset: (PathBuf, PathBuf),

    /// Oracle translations aligned with the unlabeled corpus
    #[arg(long)]
    oracle: PathBuf,

    /// Token budget for this round
    #[arg(long = "tok-budget", visible_alias = "tb")]
    tok_budget: usize,

    /// Where to write the remaining unlabeled corpus
    #[arg(long = "output-unlabeled-dataset", visible_alias = "ou")]
    output_unlabeled_dataset: PathBuf,

    /// Where to write the grown labeled corpus, as "src,tgt"
    #[arg(long = "output-labeled-dataset", visible_alias = "ol", value_parser = parse_path_pair)]
    output_labeled_dataset: (PathBuf, PathBuf),

    /// Where to write the remaining oracle
    #[arg(long = "output-oracle", visible_alias = "oo")]
    output_oracle: PathBuf,

    /// random, longest, shortest, lc, margin, te or tte
    #[arg(short = 'a', long)]
    active_func: String,

    /// JSON query config; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Checkpoint directory for model-based strategies
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Maximum generation length
    #[arg(long)]
    max_len: Option<usize>,

    /// Decode on CPU even when an accelerator is available
    #[arg(long)]
    no_cuda: bool,

    /// Sentences per inference batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum sentences per batch when batching by tokens
    #[arg(long)]
    max_batch_size: Option<usize>,

    /// Maximum padded tokens per inference batch
    #[arg(long)]
    tokens_per_batch: Option<usize>,

    /// Largest sub-batch decoded at once
    #[arg(long)]
    max_decode_batch: Option<usize>,

    /// Seed for random ranking and batch shuffling
    #[arg(long)]
    seed: Option<u64>,
}

impl Cli {
    fn query_config(&self) -> Result<QueryConfig> {
        let mut config = match &self.config {
            Some(path) => QueryConfig::from_file(path)
                .with_context(|| format!("Failed to load query config {}", path.display()))?,
            None => QueryConfig::default(),
        };
        if self.checkpoint.is_some() {
            config.checkpoint = self.checkpoint.clone();
        }
        if let Some(max_len) = self.max_len {
            config.max_len = max_len;
        }
        if self.no_cuda {
            config.no_cuda = true;
        }
        if self.batch_size.is_some() {
            config.batch_size = self.batch_size;
        }
        if self.max_batch_size.is_some() {
            config.dataset_max_batch_size = self.max_batch_size;
        }
        if self.tokens_per_batch.is_some() {
            config.tokens_per_batch = self.tokens_per_batch;
        }
        if let Some(max_decode_batch) = self.max_decode_batch {
            config.max_batch_size = max_decode_batch;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let strategy: Strategy = cli.active_func.parse()?;
    let config = cli.query_config()?;

    let (labeled_src, labeled_tgt) = &cli.labeled_dataset;
    let corpora = Corpora::load(&cli.unlabeled_dataset, labeled_src, labeled_tgt, &cli.oracle)
        .context("Failed to load corpora")?;
    tracing::info!(
        "Loaded {} unlabeled and {} labeled sentences",
        corpora.unlabeled.len(),
        corpora.labeled_src.len()
    );

    let learner = ActiveLearner::new(config)?;

    let start = Instant::now();
    let (corpora, outcome) = learner.run_round(corpora, strategy, cli.tok_budget)?;
    tracing::info!(
        "Query round finished in {:.2}s: {} sentences selected",
        start.elapsed().as_secs_f64(),
        outcome.indices.len()
    );

    let (out_src, out_tgt) = &cli.output_labeled_dataset;
    corpora
        .save(&cli.output_unlabeled_dataset, out_src, out_tgt, &cli.output_oracle)
        .context("Failed to write corpora")?;

    Ok(())
}
