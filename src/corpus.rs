//! The three aligned corpora and the query mutation applied to them
//!
//! `oracle[i]` is the reference translation of `unlabeled[i]`. A query moves
//! the admitted rows from both into the labeled pair lists in one filter pass
//! so the two pools cannot drift out of alignment.

use std::collections::HashSet;
use std::path::Path;

use crate::error::{Error, Result};

/// Unlabeled pool, labeled pairs and oracle references
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Corpora {
    pub unlabeled: Vec<String>,
    pub labeled_src: Vec<String>,
    pub labeled_tgt: Vec<String>,
    pub oracle: Vec<String>,
}

/// What one query moved into the labeled corpus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutcome {
    /// Admitted pool indices, in admission order
    pub indices: Vec<usize>,
    /// Source sentences in admission order
    pub sources: Vec<String>,
    /// Oracle translations in admission order
    pub targets: Vec<String>,
}

impl Corpora {
    pub fn new(
        unlabeled: Vec<String>,
        labeled_src: Vec<String>,
        labeled_tgt: Vec<String>,
        oracle: Vec<String>,
    ) -> Result<Self> {
        let corpora = Self {
            unlabeled,
            labeled_src,
            labeled_tgt,
            oracle,
        };
        corpora.check_aligned()?;
        Ok(corpora)
    }

    /// Read all four files
    pub fn load(
        unlabeled: &Path,
        labeled_src: &Path,
        labeled_tgt: &Path,
        oracle: &Path,
    ) -> Result<Self> {
        Self::new(
            read_lines(unlabeled)?,
            read_lines(labeled_src)?,
            read_lines(labeled_tgt)?,
            read_lines(oracle)?,
        )
    }

    /// Write all four files
    pub fn save(
        &self,
        unlabeled: &Path,
        labeled_src: &Path,
        labeled_tgt: &Path,
        oracle: &Path,
    ) -> Result<()> {
        write_lines(unlabeled, &self.unlabeled)?;
        write_lines(labeled_src, &self.labeled_src)?;
        write_lines(labeled_tgt, &self.labeled_tgt)?;
        write_lines(oracle, &self.oracle)
    }

    pub fn check_aligned(&self) -> Result<()> {
        if self.oracle.len() != self.unlabeled.len() {
            return Err(Error::CorpusMismatch {
                unlabeled: self.unlabeled.len(),
                oracle: self.oracle.len(),
            });
        }
        if self.labeled_src.len() != self.labeled_tgt.len() {
            return Err(Error::LabeledMismatch {
                source_side: self.labeled_src.len(),
                target_side: self.labeled_tgt.len(),
            });
        }
        Ok(())
    }

    /// Move `admitted` rows from the unlabeled/oracle pools into the labeled pairs.
    ///
    /// Labeled lists grow in admission order; retained pool rows keep their
    /// relative order.
    pub fn apply_query(self, admitted: &[usize]) -> Result<(Corpora, QueryOutcome)> {
        self.check_aligned()?;

        let pool_len = self.unlabeled.len();
        let mut selected = HashSet::with_capacity(admitted.len());
        for &idx in admitted {
            if idx >= pool_len {
                return Err(Error::IndexOutOfRange {
                    index: idx,
                    len: pool_len,
                });
            }
            if !selected.insert(idx) {
                return Err(Error::DuplicateIndex(idx));
            }
        }

        let sources: Vec<String> = admitted.iter().map(|&i| self.unlabeled[i].clone()).collect();
        let targets: Vec<String> = admitted.iter().map(|&i| self.oracle[i].clone()).collect();
        assert_eq!(sources.len(), admitted.len());
        assert_eq!(targets.len(), admitted.len());

        let Corpora {
            unlabeled,
            mut labeled_src,
            mut labeled_tgt,
            oracle,
        } = self;

        let (unlabeled, oracle): (Vec<String>, Vec<String>) = unlabeled
            .into_iter()
            .zip(oracle)
            .enumerate()
            .filter(|(i, _)| !selected.contains(i))
            .map(|(_, pair)| pair)
            .unzip();

        labeled_src.extend(sources.iter().cloned());
        labeled_tgt.extend(targets.iter().cloned());

        let corpora = Corpora {
            unlabeled,
            labeled_src,
            labeled_tgt,
            oracle,
        };
        let outcome = QueryOutcome {
            indices: admitted.to_vec(),
            sources,
            targets,
        };
        Ok((corpora, outcome))
    }
}

/// Read a newline-delimited file; a trailing newline does not add an empty line
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    Ok(content.lines().map(str::to_string).collect())
}

/// Write lines joined by newlines with a trailing newline
pub fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut content = lines.join("\n");
    content.push('\n');
    std::fs::write(path, content)
        .map_err(|e| Error::io(format!("failed to write {}", path.display()), e))
}
