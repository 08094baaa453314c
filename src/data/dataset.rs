//! Dataset trait and batch type for the training data pipeline.

use ndarray::Array2;
use rand_chacha::ChaCha8Rng;

use crate::error::Result;

/// A batch of training inputs, `[batch_size, features]`.
///
/// The workload's loss is a reduction over the model output, so batches
/// carry no targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Array2<f32>,
}

impl Batch {
    pub fn new(inputs: Array2<f32>) -> Self {
        Self { inputs }
    }

    pub fn batch_size(&self) -> usize {
        self.inputs.nrows()
    }
}

/// Trait for datasets whose samples may draw from the loader's generator.
///
/// The generator is owned by the [`DataLoader`](super::DataLoader) and
/// seeded per run, so a dataset never touches process-wide random state.
/// Samples are produced in iteration order; a dataset that draws from
/// `rng` yields different values for the same index in later epochs.
///
/// # Example
///
/// ```ignore
/// struct Ramp { n: usize }
///
/// impl Dataset for Ramp {
///     fn len(&self) -> usize { self.n }
///     fn sample_width(&self) -> usize { 1 }
///     fn get(&self, idx: usize, _rng: &mut ChaCha8Rng) -> Result<Vec<f32>> {
///         Ok(vec![idx as f32])
///     }
/// }
/// ```
pub trait Dataset: Send + Sync {
    /// Number of samples in the dataset.
    fn len(&self) -> usize;

    /// Whether the dataset is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of features per sample.
    fn sample_width(&self) -> usize;

    /// Produce sample `idx` as a flat feature vector.
    fn get(&self, idx: usize, rng: &mut ChaCha8Rng) -> Result<Vec<f32>>;
}
