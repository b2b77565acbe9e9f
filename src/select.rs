//! Ranking and greedy budget admission

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Error, Result};
use crate::scoring::{ScoredIndex, Strategy};

/// Order pool indices for `strategy`.
///
/// * `lengths` - token length of every pool sentence
/// * `scores` - required for uncertainty strategies; ignored otherwise
///
/// Sorts are stable, so ties keep presentation order.
pub fn rank<R: Rng + ?Sized>(
    strategy: Strategy,
    lengths: &[usize],
    scores: Option<&[ScoredIndex]>,
    rng: &mut R,
) -> Result<Vec<usize>> {
    let mut order: Vec<usize> = (0..lengths.len()).collect();
    match strategy {
        Strategy::Random => order.shuffle(rng),
        Strategy::Longest => order.sort_by_key(|&i| std::cmp::Reverse(lengths[i])),
        Strategy::Shortest => order.sort_by_key(|&i| lengths[i]),
        Strategy::Uncertainty(func) => {
            let scores = scores.ok_or_else(|| {
                Error::Config(format!("strategy {func} needs model scores"))
            })?;
            order = rank_by_score(scores, lengths.len())?;
        }
    }
    Ok(order)
}

/// Ascending score order (most uncertain first); validates the indices
fn rank_by_score(scores: &[ScoredIndex], pool_len: usize) -> Result<Vec<usize>> {
    let mut seen = HashSet::with_capacity(scores.len());
    for s in scores {
        if s.index >= pool_len {
            return Err(Error::IndexOutOfRange {
                index: s.index,
                len: pool_len,
            });
        }
        if !seen.insert(s.index) {
            return Err(Error::DuplicateIndex(s.index));
        }
    }

    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.score.total_cmp(&b.score));
    Ok(sorted.into_iter().map(|s| s.index).collect())
}

/// Longest prefix of `order` whose summed token length fits in `budget`
pub fn admit(order: &[usize], lengths: &[usize], budget: usize) -> Vec<usize> {
    let mut used = 0usize;
    order
        .iter()
        .copied()
        .take_while(|&i| {
            used += lengths[i];
            used <= budget
        })
        .collect()
}
