//! Error types for active-nmt-rs
//!
//! Contract violations (misaligned corpora, scores that do not match the
//! presented indices) are reported as typed errors so the binary can exit
//! with a diagnostic. They are never retried.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for active-nmt-rs
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("unknown active function '{0}' (expected one of random, longest, shortest, lc, margin, te, tte)")]
    UnknownStrategy(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("oracle has {oracle} lines but unlabeled pool has {unlabeled}")]
    CorpusMismatch { unlabeled: usize, oracle: usize },

    #[error("labeled corpus sides differ: {source_side} source vs {target_side} target lines")]
    LabeledMismatch {
        source_side: usize,
        target_side: usize,
    },

    #[error("got {scores} scores for {indices} indices")]
    ScoreCountMismatch { scores: usize, indices: usize },

    #[error("index {index} out of range for pool of {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("index {0} appears more than once")]
    DuplicateIndex(usize),
}

impl Error {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error is a data/caller contract violation rather than
    /// an environment failure
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::CorpusMismatch { .. }
                | Self::LabeledMismatch { .. }
                | Self::ScoreCountMismatch { .. }
                | Self::IndexOutOfRange { .. }
                | Self::DuplicateIndex(_)
                | Self::UnknownStrategy(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_classification() {
        assert!(Error::CorpusMismatch {
            unlabeled: 3,
            oracle: 2
        }
        .is_contract_violation());
        assert!(Error::UnknownStrategy("foo".into()).is_contract_violation());
        assert!(!Error::CheckpointNotFound(PathBuf::from("/nope")).is_contract_violation());
    }

    #[test]
    fn test_messages() {
        let err = Error::ScoreCountMismatch {
            scores: 2,
            indices: 3,
        };
        assert_eq!(err.to_string(), "got 2 scores for 3 indices");
    }
}
