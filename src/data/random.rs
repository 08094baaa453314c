//! Synthetic dataset of uniform random features

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::data::dataset::Dataset;
use crate::error::{Error, Result};

/// `num_samples` vectors of `input_size` features drawn from U[0, 1).
///
/// Values come from the loader's generator at access time, so the stream
/// is fixed by the loader seed and the access order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomDataset {
    num_samples: usize,
    input_size: usize,
}

impl RandomDataset {
    pub fn new(num_samples: usize, input_size: usize) -> Result<Self> {
        if input_size == 0 {
            return Err(Error::DataError {
                reason: "input_size must be > 0".to_string(),
            });
        }
        Ok(Self {
            num_samples,
            input_size,
        })
    }
}

impl Default for RandomDataset {
    fn default() -> Self {
        Self {
            num_samples: 200,
            input_size: 1000,
        }
    }
}

impl Dataset for RandomDataset {
    fn len(&self) -> usize {
        self.num_samples
    }

    fn sample_width(&self) -> usize {
        self.input_size
    }

    fn get(&self, idx: usize, rng: &mut ChaCha8Rng) -> Result<Vec<f32>> {
        if idx >= self.num_samples {
            return Err(Error::DataError {
                reason: format!("index {idx} out of range ({} samples)", self.num_samples),
            });
        }
        Ok((0..self.input_size).map(|_| rng.gen::<f32>()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_samples_in_unit_interval() {
        let ds = RandomDataset::new(4, 32).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2023);
        let sample = ds.get(0, &mut rng).unwrap();
        assert_eq!(sample.len(), 32);
        assert!(sample.iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn test_same_seed_same_stream() {
        let ds = RandomDataset::new(4, 8).unwrap();
        let mut a = ChaCha8Rng::seed_from_u64(1);
        let mut b = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(ds.get(0, &mut a).unwrap(), ds.get(0, &mut b).unwrap());
        // the stream advances between accesses
        let first = ds.get(1, &mut a).unwrap();
        let second = ds.get(1, &mut a).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let ds = RandomDataset::new(2, 8).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(ds.get(2, &mut rng).is_err());
        assert!(RandomDataset::new(2, 0).is_err());
    }

    #[test]
    fn test_default_matches_reference_job() {
        let ds = RandomDataset::default();
        assert_eq!(ds.len(), 200);
        assert_eq!(ds.sample_width(), 1000);
    }
}
