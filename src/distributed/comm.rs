//! In-process process groups and collectives
//!
//! Every simulated rank owns one flat `f32` buffer; a collective reads and
//! writes a range of the member buffers, indexed by global rank. Reductions
//! combine members with a fixed pairwise tree in group-rank order, so the
//! result never depends on thread scheduling.

use std::ops::Range;

use crate::error::{Error, Result};

/// Reduction operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    /// Sum, then multiply by `1 / group_size`
    Avg,
    Max,
}

/// Ordered set of global ranks taking part in collectives together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGroup {
    ranks: Vec<usize>,
}

impl ProcessGroup {
    pub fn new(ranks: Vec<usize>) -> Result<Self> {
        if ranks.is_empty() {
            return Err(Error::DistributedError {
                reason: "process group has no ranks".to_string(),
            });
        }
        for (i, r) in ranks.iter().enumerate() {
            if ranks[..i].contains(r) {
                return Err(Error::DistributedError {
                    reason: format!("rank {r} listed twice in process group"),
                });
            }
        }
        Ok(Self { ranks })
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn contains(&self, rank: usize) -> bool {
        self.ranks.contains(&rank)
    }

    /// Position of a global rank inside this group.
    pub fn group_rank(&self, rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == rank)
    }

    /// Global rank at group position `group_rank`.
    pub fn global_rank(&self, group_rank: usize) -> Result<usize> {
        self.ranks.get(group_rank).copied().ok_or_else(|| Error::DistributedError {
            reason: format!("group rank {group_rank} out of range (size {})", self.size()),
        })
    }

    fn check<T>(&self, buffers: &[Vec<T>], range: &Range<usize>) -> Result<()> {
        for &r in &self.ranks {
            let buf = buffers.get(r).ok_or_else(|| Error::DistributedError {
                reason: format!("no buffer for rank {r} ({} buffers)", buffers.len()),
            })?;
            if range.end > buf.len() || range.start > range.end {
                return Err(Error::DistributedError {
                    reason: format!(
                        "range {range:?} out of bounds for rank {r} buffer of {}",
                        buf.len()
                    ),
                });
            }
        }
        Ok(())
    }

    fn check_root(&self, root: usize) -> Result<()> {
        if !self.contains(root) {
            return Err(Error::DistributedError {
                reason: format!("root rank {root} is not in group {:?}", self.ranks),
            });
        }
        Ok(())
    }

    /// Pairwise tree reduction of the member ranges, in group-rank order.
    fn tree_reduce(&self, buffers: &[Vec<f32>], range: &Range<usize>, op: ReduceOp) -> Vec<f32> {
        let mut level: Vec<Vec<f32>> = self
            .ranks
            .iter()
            .map(|&r| buffers[r][range.clone()].to_vec())
            .collect();

        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            let mut iter = level.into_iter();
            while let Some(mut left) = iter.next() {
                if let Some(right) = iter.next() {
                    for (l, r) in left.iter_mut().zip(&right) {
                        *l = match op {
                            ReduceOp::Sum | ReduceOp::Avg => *l + *r,
                            ReduceOp::Max => l.max(*r),
                        };
                    }
                }
                next.push(left);
            }
            level = next;
        }

        let mut out = level.pop().unwrap_or_default();
        if op == ReduceOp::Avg && self.size() > 1 {
            let inv = (1.0 / self.size() as f64) as f32;
            for v in out.iter_mut() {
                *v *= inv;
            }
        }
        out
    }

    /// Reduce `range` across members; every member receives the result.
    pub fn all_reduce(&self, buffers: &mut [Vec<f32>], range: Range<usize>, op: ReduceOp) -> Result<()> {
        self.check(buffers, &range)?;
        if self.size() == 1 {
            return Ok(());
        }
        let result = self.tree_reduce(buffers, &range, op);
        for &r in &self.ranks {
            buffers[r][range.clone()].copy_from_slice(&result);
        }
        Ok(())
    }

    /// Reduce `range` across members into `root` only.
    pub fn reduce(
        &self,
        buffers: &mut [Vec<f32>],
        range: Range<usize>,
        root: usize,
        op: ReduceOp,
    ) -> Result<()> {
        self.check(buffers, &range)?;
        self.check_root(root)?;
        if self.size() == 1 {
            return Ok(());
        }
        let result = self.tree_reduce(buffers, &range, op);
        buffers[root][range].copy_from_slice(&result);
        Ok(())
    }

    /// Copy `range` from `root` to every other member.
    pub fn broadcast(&self, buffers: &mut [Vec<f32>], range: Range<usize>, root: usize) -> Result<()> {
        self.check(buffers, &range)?;
        self.check_root(root)?;
        if self.size() == 1 {
            return Ok(());
        }
        let src = buffers[root][range.clone()].to_vec();
        for &r in &self.ranks {
            if r != root {
                buffers[r][range.clone()].copy_from_slice(&src);
            }
        }
        Ok(())
    }

    /// Concatenate every member's contribution in group-rank order.
    ///
    /// All members receive the same sequence, so it is returned once.
    pub fn all_gather<T: Clone>(&self, contributions: &[Vec<T>]) -> Result<Vec<T>> {
        let mut gathered = Vec::new();
        for &r in &self.ranks {
            let part = contributions.get(r).ok_or_else(|| Error::DistributedError {
                reason: format!("no contribution from rank {r}"),
            })?;
            gathered.extend_from_slice(part);
        }
        Ok(gathered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers(values: &[&[f32]]) -> Vec<Vec<f32>> {
        values.iter().map(|v| v.to_vec()).collect()
    }

    #[test]
    fn test_all_reduce_sum_and_avg() {
        let group = ProcessGroup::new(vec![0, 1, 2, 3]).unwrap();
        let mut bufs = buffers(&[&[1.0, 2.0], &[3.0, 4.0], &[5.0, 6.0], &[7.0, 8.0]]);
        group.all_reduce(&mut bufs, 0..2, ReduceOp::Sum).unwrap();
        assert!(bufs.iter().all(|b| b == &[16.0, 20.0]));

        let mut bufs = buffers(&[&[1.0, 2.0], &[3.0, 4.0], &[5.0, 6.0], &[7.0, 8.0]]);
        group.all_reduce(&mut bufs, 0..2, ReduceOp::Avg).unwrap();
        assert!(bufs.iter().all(|b| b == &[4.0, 5.0]));
    }

    #[test]
    fn test_avg_of_identical_values_is_exact() {
        let x = [0.1f32, -1.7e-5, 3.3333];
        for n in [1usize, 2, 4, 8] {
            let group = ProcessGroup::new((0..n).collect()).unwrap();
            let mut bufs = vec![x.to_vec(); n];
            group.all_reduce(&mut bufs, 0..3, ReduceOp::Avg).unwrap();
            assert!(bufs.iter().all(|b| b == &x), "group size {n}");
        }
    }

    #[test]
    fn test_strided_group_touches_only_members() {
        let group = ProcessGroup::new(vec![1, 3]).unwrap();
        let mut bufs = buffers(&[&[1.0], &[2.0], &[3.0], &[4.0]]);
        group.all_reduce(&mut bufs, 0..1, ReduceOp::Max).unwrap();
        assert_eq!(bufs, buffers(&[&[1.0], &[4.0], &[3.0], &[4.0]]));
    }

    #[test]
    fn test_reduce_to_root_leaves_others() {
        let group = ProcessGroup::new(vec![0, 1]).unwrap();
        let mut bufs = buffers(&[&[1.0, 1.0, 1.0], &[3.0, 3.0, 3.0]]);
        group.reduce(&mut bufs, 1..2, 1, ReduceOp::Avg).unwrap();
        assert_eq!(bufs, buffers(&[&[1.0, 1.0, 1.0], &[3.0, 2.0, 3.0]]));
        assert!(group.reduce(&mut bufs, 0..1, 2, ReduceOp::Sum).is_err());
    }

    #[test]
    fn test_broadcast_range() {
        let group = ProcessGroup::new(vec![0, 1, 2]).unwrap();
        let mut bufs = buffers(&[&[0.0, 0.0], &[5.0, 6.0], &[0.0, 0.0]]);
        group.broadcast(&mut bufs, 1..2, 1).unwrap();
        assert_eq!(bufs, buffers(&[&[0.0, 6.0], &[5.0, 6.0], &[0.0, 6.0]]));
    }

    #[test]
    fn test_all_gather_in_group_order() {
        let group = ProcessGroup::new(vec![2, 0]).unwrap();
        let parts = vec![vec![1u32], vec![9], vec![2, 3]];
        assert_eq!(group.all_gather(&parts).unwrap(), vec![2, 3, 1]);
    }

    #[test]
    fn test_odd_group_tree() {
        let group = ProcessGroup::new(vec![0, 1, 2]).unwrap();
        let mut bufs = buffers(&[&[1.0], &[2.0], &[4.0]]);
        group.all_reduce(&mut bufs, 0..1, ReduceOp::Sum).unwrap();
        assert!(bufs.iter().all(|b| b == &[7.0]));
    }

    #[test]
    fn test_invalid_groups_and_ranges() {
        assert!(ProcessGroup::new(vec![]).is_err());
        assert!(ProcessGroup::new(vec![0, 0]).is_err());
        let group = ProcessGroup::new(vec![0, 5]).unwrap();
        let mut bufs = buffers(&[&[1.0], &[2.0]]);
        assert!(group.all_reduce(&mut bufs, 0..1, ReduceOp::Sum).is_err());
        let group = ProcessGroup::new(vec![0, 1]).unwrap();
        assert!(group.all_reduce(&mut bufs, 0..2, ReduceOp::Sum).is_err());
    }
}
