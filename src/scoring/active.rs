//! Query strategies and per-step uncertainty functions
//!
//! Every step contribution is signed so that larger means more confident:
//! least confidence gives p1 - 1, margin gives p1 - p2 and both entropy
//! variants give -H. Sorting accumulated scores ascending therefore puts the
//! most uncertain sentences first for all four functions.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Result, Tensor, D};

use crate::error::Error;

/// Model-based uncertainty function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActiveFunc {
    /// `lc`
    LeastConfidence,
    /// `margin`
    Margin,
    /// `te`: mean token entropy
    TokenEntropy,
    /// `tte`: summed token entropy
    TotalTokenEntropy,
}

impl ActiveFunc {
    pub const ALL: [ActiveFunc; 4] = [
        ActiveFunc::LeastConfidence,
        ActiveFunc::Margin,
        ActiveFunc::TokenEntropy,
        ActiveFunc::TotalTokenEntropy,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::LeastConfidence => "lc",
            Self::Margin => "margin",
            Self::TokenEntropy => "te",
            Self::TotalTokenEntropy => "tte",
        }
    }

    /// Whether the accumulated score is divided by generated length
    pub fn normalize_by_length(self) -> bool {
        !matches!(self, Self::TotalTokenEntropy)
    }

    /// Per-sentence contribution [batch] (f32) from log-probabilities [batch, vocab]
    pub fn step_contribution(self, log_probs: &Tensor) -> Result<Tensor> {
        let log_probs = log_probs.to_dtype(DType::F32)?;
        let probs = log_probs.exp()?;
        match self {
            Self::LeastConfidence => probs.max(D::Minus1)? - 1.0,
            Self::Margin => {
                let top1 = probs.max(D::Minus1)?;
                // Push the arg-max entry below every other probability, then
                // take the max again. Ties with the top entry survive, giving 0.
                let vocab = probs.dim(D::Minus1)?;
                let top_idx = probs.argmax(D::Minus1)?;
                let hot = candle_nn::encoding::one_hot(top_idx, vocab, 2f32, 0f32)?;
                let top2 = (&probs - hot)?.max(D::Minus1)?.clamp(0f32, 1f32)?;
                top1 - top2
            }
            Self::TokenEntropy | Self::TotalTokenEntropy => {
                // -H(p) = sum(p * log p)
                (probs * log_probs)?.sum(D::Minus1)
            }
        }
    }
}

impl fmt::Display for ActiveFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the unlabeled pool is ordered before the budget cut
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Random,
    Longest,
    Shortest,
    Uncertainty(ActiveFunc),
}

impl Strategy {
    /// Whether ranking needs model scores
    pub fn needs_model(self) -> bool {
        matches!(self, Self::Uncertainty(_))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Longest => "longest",
            Self::Shortest => "shortest",
            Self::Uncertainty(func) => func.name(),
        }
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "random" => Ok(Self::Random),
            "longest" => Ok(Self::Longest),
            "shortest" => Ok(Self::Shortest),
            "lc" => Ok(Self::Uncertainty(ActiveFunc::LeastConfidence)),
            "margin" => Ok(Self::Uncertainty(ActiveFunc::Margin)),
            "te" => Ok(Self::Uncertainty(ActiveFunc::TokenEntropy)),
            "tte" => Ok(Self::Uncertainty(ActiveFunc::TotalTokenEntropy)),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
