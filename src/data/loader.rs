//! Sequential DataLoader with an owned, seeded generator.
//!
//! Iterates over a `Dataset` in index order, producing collated `Batch`es
//! with a leading batch dimension and dropping the last incomplete batch.
//! The generator is seeded once at construction and continues across
//! epochs, so every run built with the same seed sees the same stream.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::data::collate::collate_batch;
use crate::data::dataset::{Batch, Dataset};
use crate::error::{Error, Result};

/// DataLoader that iterates a dataset in fixed-size batches.
///
/// # Lifecycle
///
/// ```ignore
/// let mut loader = DataLoader::new(dataset, batch_size, seed)?;
/// for epoch in 0..num_epochs {
///     for batch in loader.epoch() {
///         let batch = batch?;
///         // batch.inputs: [batch_size, width]
///     }
/// }
/// ```
pub struct DataLoader<D> {
    dataset: D,
    batch_size: usize,
    rng: ChaCha8Rng,
}

impl<D> DataLoader<D>
where
    D: Dataset,
{
    /// Create a new DataLoader.
    ///
    /// # Arguments
    /// * `dataset` - The dataset to iterate
    /// * `batch_size` - Number of samples per batch
    /// * `seed` - Seed for the generator handed to the dataset
    pub fn new(dataset: D, batch_size: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::DataError {
                reason: "batch_size must be > 0".to_string(),
            });
        }
        Ok(Self {
            dataset,
            batch_size,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Number of batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Create an iterator for the next epoch.
    pub fn epoch(&mut self) -> DataLoaderIter<'_, D> {
        let num_batches = self.num_batches();
        DataLoaderIter {
            dataset: &self.dataset,
            rng: &mut self.rng,
            batch_size: self.batch_size,
            batch_idx: 0,
            num_batches,
        }
    }
}

/// Iterator over batches in one epoch.
///
/// Implements `Iterator<Item = Result<Batch>>`.
pub struct DataLoaderIter<'a, D> {
    dataset: &'a D,
    rng: &'a mut ChaCha8Rng,
    batch_size: usize,
    batch_idx: usize,
    num_batches: usize,
}

impl<D> DataLoaderIter<'_, D>
where
    D: Dataset,
{
    /// Number of batches remaining in this epoch.
    pub fn remaining(&self) -> usize {
        self.num_batches - self.batch_idx
    }

    fn advance(&mut self) -> Result<Option<Batch>> {
        if self.batch_idx >= self.num_batches {
            return Ok(None);
        }

        let start = self.batch_idx * self.batch_size;
        let indices: Vec<usize> = (start..start + self.batch_size).collect();
        let batch = collate_batch(self.dataset, &indices, self.rng)?;

        self.batch_idx += 1;
        Ok(Some(batch))
    }
}

impl<D> Iterator for DataLoaderIter<'_, D>
where
    D: Dataset,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(e) => {
                // stop after the first error
                self.batch_idx = self.num_batches;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl<D> ExactSizeIterator for DataLoaderIter<'_, D> where D: Dataset {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::random::RandomDataset;
    use rand::Rng;

    struct SeqDataset {
        size: usize,
    }

    impl Dataset for SeqDataset {
        fn len(&self) -> usize {
            self.size
        }

        fn sample_width(&self) -> usize {
            2
        }

        fn get(&self, idx: usize, _rng: &mut ChaCha8Rng) -> Result<Vec<f32>> {
            let val = idx as f32;
            Ok(vec![val, val + 0.5])
        }
    }

    struct Ragged;

    impl Dataset for Ragged {
        fn len(&self) -> usize {
            4
        }

        fn sample_width(&self) -> usize {
            2
        }

        fn get(&self, idx: usize, rng: &mut ChaCha8Rng) -> Result<Vec<f32>> {
            Ok(vec![rng.gen(); idx + 1])
        }
    }

    #[test]
    fn test_dataloader_basic() {
        let mut loader = DataLoader::new(SeqDataset { size: 10 }, 3, 0).unwrap();
        assert_eq!(loader.num_batches(), 3);

        let mut count = 0;
        for batch in loader.epoch() {
            let batch = batch.expect("batch should not error");
            assert_eq!(batch.inputs.dim(), (3, 2));
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_dataloader_sequential_order() {
        let mut loader = DataLoader::new(SeqDataset { size: 4 }, 2, 0).unwrap();
        let batches: Vec<Batch> = loader.epoch().map(|b| b.unwrap()).collect();
        assert_eq!(batches[0].inputs.column(0).to_vec(), vec![0.0, 1.0]);
        assert_eq!(batches[1].inputs.column(0).to_vec(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_same_seed_same_batches() {
        let ds = RandomDataset::new(20, 4).unwrap();
        let mut a = DataLoader::new(ds, 5, 2023).unwrap();
        let mut b = DataLoader::new(ds, 5, 2023).unwrap();
        for _ in 0..2 {
            let xa: Vec<Batch> = a.epoch().map(|b| b.unwrap()).collect();
            let xb: Vec<Batch> = b.epoch().map(|b| b.unwrap()).collect();
            assert_eq!(xa, xb);
        }
    }

    #[test]
    fn test_epochs_continue_the_stream() {
        let ds = RandomDataset::new(10, 4).unwrap();
        let mut loader = DataLoader::new(ds, 5, 42).unwrap();
        let epoch0: Vec<Batch> = loader.epoch().map(|b| b.unwrap()).collect();
        let epoch1: Vec<Batch> = loader.epoch().map(|b| b.unwrap()).collect();
        assert_eq!(epoch0.len(), epoch1.len());
        assert_ne!(epoch0, epoch1);
    }

    #[test]
    fn test_dataloader_drops_last_partial_batch() {
        let mut loader = DataLoader::new(SeqDataset { size: 2 }, 5, 0).unwrap();
        assert_eq!(loader.num_batches(), 0);
        let mut iter = loader.epoch();
        assert_eq!(iter.len(), 0);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_dataloader_reports_ragged_samples() {
        let mut loader = DataLoader::new(Ragged, 2, 0).unwrap();
        let mut iter = loader.epoch();
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        assert!(DataLoader::new(SeqDataset { size: 2 }, 0, 0).is_err());
    }
}
