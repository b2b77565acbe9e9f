//! active-nmt-rs: uncertainty-driven active learning for machine translation
//!
//! Picks, from a pool of unlabeled source sentences, the subset worth sending
//! to a labeling oracle under a token budget. Model-based strategies score
//! each sentence by greedily decoding it with an incremental (KV-cached)
//! encoder-decoder and accumulating a per-step uncertainty measure.

pub mod batch;
pub mod cache;
pub mod config;
pub mod corpus;
pub mod data;
pub mod engine;
pub mod error;
pub mod model;
pub mod scoring;
pub mod select;
pub mod text;
pub mod vocab;
pub mod weights;

pub use config::{ModelConfig, QueryConfig};
pub use corpus::{Corpora, QueryOutcome};
pub use engine::{ActiveLearner, Query};
pub use error::{Error, Result};
pub use scoring::{ActiveFunc, ScoredIndex, Strategy};
