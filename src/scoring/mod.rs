//! Uncertainty scoring: strategies, the incremental scorer and batch aggregation

pub mod active;
pub mod aggregate;
pub mod scorer;

pub use active::{ActiveFunc, Strategy};
pub use aggregate::{score_batches, source_mask};
pub use scorer::{Hypothesis, ScoredIndex, UncertaintyScorer};
