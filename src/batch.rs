//! Inference batches and the batch splitter
//!
//! A batch carries its token tensor together with the original pool index of
//! every row. Oversized batches are cut into consecutive sub-batches; the
//! common unsplit case is simply a one-element sequence.

use candle_core::{Result, Tensor};

/// Token ids [batch, src_len] plus the pool index of each row
#[derive(Debug, Clone)]
pub struct Batch {
    pub src: Tensor,
    pub indices: Vec<usize>,
}

impl Batch {
    /// Pair a tensor with its row indices. Row count and index count must agree.
    pub fn new(src: Tensor, indices: Vec<usize>) -> Result<Self> {
        let rows = src.dim(0)?;
        if rows != indices.len() {
            candle_core::bail!("batch has {} rows but {} indices", rows, indices.len());
        }
        Ok(Self { src, indices })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Ordered sub-batches produced from one batch
#[derive(Debug, Clone)]
pub struct SplitBatch {
    chunks: Vec<Batch>,
}

impl SplitBatch {
    /// True when the source batch exceeded the size bound
    pub fn was_split(&self) -> bool {
        self.chunks.len() > 1
    }

    pub fn chunks(&self) -> &[Batch] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl IntoIterator for SplitBatch {
    type Item = Batch;
    type IntoIter = std::vec::IntoIter<Batch>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.into_iter()
    }
}

/// Split `batch` into consecutive chunks of at most `max_batch_size` rows.
///
/// All chunks hold `max_batch_size` rows except possibly the last. Index
/// chunks follow the tensor chunks one-to-one, in order.
pub fn split_batch(batch: Batch, max_batch_size: usize) -> Result<SplitBatch> {
    assert!(max_batch_size > 0, "max_batch_size must be positive");
    let bsz = batch.src.dim(0)?;
    assert_eq!(bsz, batch.indices.len(), "batch rows and indices diverged");

    if bsz <= max_batch_size {
        return Ok(SplitBatch {
            chunks: vec![batch],
        });
    }

    let mut chunks = Vec::with_capacity(bsz.div_ceil(max_batch_size));
    let mut start = 0;
    while start < bsz {
        let size = max_batch_size.min(bsz - start);
        let src = batch.src.narrow(0, start, size)?;
        let indices = batch.indices[start..start + size].to_vec();
        chunks.push(Batch { src, indices });
        start += size;
    }

    Ok(SplitBatch { chunks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use proptest::prelude::*;

    fn make_batch(rows: usize, cols: usize) -> Result<Batch> {
        let data: Vec<u32> = (0..(rows * cols) as u32).collect();
        let src = Tensor::from_vec(data, (rows, cols), &Device::Cpu)?;
        // Shuffled-looking indices to make order loss visible
        let indices = (0..rows).map(|i| (i * 7919) % (rows + 13)).collect();
        Batch::new(src, indices)
    }

    fn rejoin(split: &SplitBatch) -> Result<(Vec<u32>, Vec<usize>)> {
        let tensors: Vec<&Tensor> = split.chunks().iter().map(|c| &c.src).collect();
        let src = Tensor::cat(&tensors, 0)?;
        let indices = split
            .chunks()
            .iter()
            .flat_map(|c| c.indices.iter().copied())
            .collect();
        Ok((src.flatten_all()?.to_vec1()?, indices))
    }

    #[test]
    fn test_small_batch_not_split() -> Result<()> {
        let batch = make_batch(5, 3)?;
        let split = split_batch(batch.clone(), 5)?;
        assert!(!split.was_split());
        assert_eq!(split.len(), 1);
        assert_eq!(split.chunks()[0].indices, batch.indices);
        Ok(())
    }

    #[test]
    fn test_thousand_rows_split_800_200() -> Result<()> {
        let batch = make_batch(1000, 2)?;
        let original = batch.indices.clone();
        let split = split_batch(batch, 800)?;

        assert!(split.was_split());
        let sizes: Vec<usize> = split.chunks().iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![800, 200]);
        assert_eq!(split.chunks()[0].indices[799], original[799]);
        assert_eq!(split.chunks()[1].indices[0], original[800]);
        for chunk in split.chunks() {
            assert_eq!(chunk.src.dim(0)?, chunk.indices.len());
        }
        Ok(())
    }

    #[test]
    fn test_mismatched_batch_rejected() -> Result<()> {
        let src = Tensor::zeros((3, 2), candle_core::DType::U32, &Device::Cpu)?;
        assert!(Batch::new(src, vec![0, 1]).is_err());
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_split_rejoin_identity(rows in 1usize..60, cols in 1usize..4, max in 1usize..70) {
            let batch = make_batch(rows, cols).unwrap();
            let flat: Vec<u32> = batch.src.flatten_all().unwrap().to_vec1().unwrap();
            let indices = batch.indices.clone();

            let split = split_batch(batch, max).unwrap();
            prop_assert_eq!(split.was_split(), rows > max);
            for (i, chunk) in split.chunks().iter().enumerate() {
                if i + 1 < split.len() {
                    prop_assert_eq!(chunk.len(), max);
                } else {
                    prop_assert!(chunk.len() <= max && !chunk.is_empty());
                }
            }

            let (joined_src, joined_indices) = rejoin(&split).unwrap();
            prop_assert_eq!(joined_src, flat);
            prop_assert_eq!(joined_indices, indices);
        }
    }
}
