//! Batch collation helper.

use ndarray::Array2;
use rand_chacha::ChaCha8Rng;

use crate::data::dataset::{Batch, Dataset};
use crate::error::{Error, Result};

/// Collate individual samples into a batch.
///
/// Fetches each sample from the dataset in index order, then stacks them
/// along a new leading batch dimension → `[batch_size, width]`.
pub(crate) fn collate_batch<D: Dataset>(
    dataset: &D,
    indices: &[usize],
    rng: &mut ChaCha8Rng,
) -> Result<Batch> {
    if indices.is_empty() {
        return Err(Error::DataError {
            reason: "empty batch indices".to_string(),
        });
    }

    let width = dataset.sample_width();
    let mut data: Vec<f32> = Vec::with_capacity(indices.len() * width);

    for &idx in indices {
        let sample = dataset.get(idx, rng)?;
        if sample.len() != width {
            return Err(Error::DataError {
                reason: format!(
                    "inconsistent sample width: expected {width}, got {}",
                    sample.len()
                ),
            });
        }
        data.extend_from_slice(&sample);
    }

    let inputs = Array2::from_shape_vec((indices.len(), width), data).map_err(|e| Error::DataError {
        reason: format!("collate: {e}"),
    })?;
    Ok(Batch::new(inputs))
}
