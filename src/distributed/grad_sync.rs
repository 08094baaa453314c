//! Whole-buffer gradient synchronization and parameter broadcasting
//!
//! Thin wrappers over [`ProcessGroup`] collectives for the two operations
//! every data-parallel replica needs: averaging gradients and starting from
//! identical parameters.

use crate::distributed::comm::{ProcessGroup, ReduceOp};
use crate::error::{Error, Result};

fn buffer_len(group: &ProcessGroup, buffers: &[Vec<f32>]) -> Result<usize> {
    let first = group.global_rank(0)?;
    buffers.get(first).map(Vec::len).ok_or_else(|| Error::DistributedError {
        reason: format!("no buffer for rank {first}"),
    })
}

/// AllReduce every member's full gradient buffer (sum, then average by group size).
///
/// # Errors
///
/// Returns `DistributedError` if a member has no buffer or buffer lengths differ.
pub fn all_reduce_grads(group: &ProcessGroup, grads: &mut [Vec<f32>]) -> Result<()> {
    if group.size() <= 1 {
        return Ok(());
    }
    let len = buffer_len(group, grads)?;
    group.all_reduce(grads, 0..len, ReduceOp::Avg)
}

/// Broadcast every member's full parameter buffer from `root`.
///
/// Ensures all ranks start with identical parameters before training begins.
pub fn broadcast_params(group: &ProcessGroup, params: &mut [Vec<f32>], root: usize) -> Result<()> {
    if group.size() <= 1 {
        return Ok(());
    }
    let len = buffer_len(group, params)?;
    group.broadcast(params, 0..len, root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_reduce_grads_noop_single_rank() {
        let group = ProcessGroup::new(vec![0]).unwrap();
        let mut grads = vec![vec![2.0f32, 4.0, 6.0]];
        all_reduce_grads(&group, &mut grads).unwrap();
        assert_eq!(grads[0], vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_all_reduce_grads_averages() {
        let group = ProcessGroup::new(vec![0, 1]).unwrap();
        let mut grads = vec![vec![1.0f32, 2.0], vec![3.0, 6.0]];
        all_reduce_grads(&group, &mut grads).unwrap();
        assert_eq!(grads, vec![vec![2.0, 4.0], vec![2.0, 4.0]]);
    }

    #[test]
    fn test_broadcast_params_from_root() {
        let group = ProcessGroup::new(vec![0, 1, 2]).unwrap();
        let mut params = vec![vec![1.0f32, 2.0], vec![0.0; 2], vec![0.0; 2]];
        broadcast_params(&group, &mut params, 0).unwrap();
        assert!(params.iter().all(|p| p == &[1.0, 2.0]));
    }

    #[test]
    fn test_mismatched_buffers_error() {
        let group = ProcessGroup::new(vec![0, 1]).unwrap();
        let mut grads = vec![vec![1.0f32, 2.0], vec![3.0]];
        assert!(all_reduce_grads(&group, &mut grads).is_err());
    }
}
