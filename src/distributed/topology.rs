//! Hybrid data-parallel × sharding rank layout
//!
//! `rank = dp_idx * sharding_degree + shard_idx`: ranks of one sharding
//! group are contiguous, ranks of one data-parallel group are strided by
//! `sharding_degree`.

use crate::error::{Error, Result};
use crate::trainer::config::ParallelStrategy;

/// Rank layout for `dp_degree` replicas of a `sharding_degree`-way group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    dp_degree: usize,
    sharding_degree: usize,
}

impl Topology {
    pub fn new(dp_degree: usize, sharding_degree: usize) -> Result<Self> {
        if dp_degree == 0 || sharding_degree == 0 {
            return Err(Error::DistributedError {
                reason: format!(
                    "degrees must be >= 1, got dp={dp_degree} sharding={sharding_degree}"
                ),
            });
        }
        Ok(Self {
            dp_degree,
            sharding_degree,
        })
    }

    /// Pure data parallel maps to `sharding_degree = 1`.
    pub fn from_strategy(strategy: &ParallelStrategy) -> Result<Self> {
        Self::new(strategy.dp_degree(), strategy.sharding_degree())
    }

    pub fn dp_degree(&self) -> usize {
        self.dp_degree
    }

    pub fn sharding_degree(&self) -> usize {
        self.sharding_degree
    }

    pub fn world_size(&self) -> usize {
        self.dp_degree * self.sharding_degree
    }

    /// `(dp_idx, shard_idx)` of a global rank.
    pub fn coords(&self, rank: usize) -> Result<(usize, usize)> {
        if rank >= self.world_size() {
            return Err(Error::DistributedError {
                reason: format!("rank {rank} out of range (world size {})", self.world_size()),
            });
        }
        Ok((rank / self.sharding_degree, rank % self.sharding_degree))
    }

    pub fn rank_of(&self, dp_idx: usize, shard_idx: usize) -> usize {
        dp_idx * self.sharding_degree + shard_idx
    }

    /// Ranks sharing optimizer state for replica `dp_idx`.
    pub fn sharding_group(&self, dp_idx: usize) -> Vec<usize> {
        (0..self.sharding_degree)
            .map(|s| self.rank_of(dp_idx, s))
            .collect()
    }

    /// Ranks holding shard `shard_idx` in every replica.
    pub fn dp_group(&self, shard_idx: usize) -> Vec<usize> {
        (0..self.dp_degree).map(|d| self.rank_of(d, shard_idx)).collect()
    }

    pub fn sharding_groups(&self) -> Vec<Vec<usize>> {
        (0..self.dp_degree).map(|d| self.sharding_group(d)).collect()
    }

    pub fn dp_groups(&self) -> Vec<Vec<usize>> {
        (0..self.sharding_degree).map(|s| self.dp_group(s)).collect()
    }
}
