//! Parallel group layout
//!
//! Describes where this process sits in a tensor- × pipeline-parallel group.
//! Global ranks are laid out stage-major: `rank = pipeline_rank * tp +
//! tensor_rank`, so the pipeline peers of a rank share its tensor rank.
//!
//! The layout decides which rank samples tokens (the last pipeline stage)
//! and which ranks only receive them.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// This process's position in the parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldLayout {
    /// Number of ranks sharing one pipeline stage (tensor parallelism).
    pub tensor_parallelism: usize,
    /// Number of pipeline stages.
    pub pipeline_parallelism: usize,
    /// Global rank of this process (`0..world_size`).
    pub rank: usize,
    /// Device ordinal this rank drives.
    #[serde(default)]
    pub device: usize,
}

impl WorldLayout {
    /// Describe one rank of a `tp × pp` group. The device ordinal defaults
    /// to the global rank.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if either degree is zero or `rank`
    /// is outside the group.
    pub fn new(tensor_parallelism: usize, pipeline_parallelism: usize, rank: usize) -> Result<Self> {
        let layout = Self {
            tensor_parallelism,
            pipeline_parallelism,
            rank,
            device: rank,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// A single process with no parallelism.
    #[must_use]
    pub fn single() -> Self {
        Self {
            tensor_parallelism: 1,
            pipeline_parallelism: 1,
            rank: 0,
            device: 0,
        }
    }

    /// Override the device ordinal.
    #[must_use]
    pub fn with_device(mut self, device: usize) -> Self {
        self.device = device;
        self
    }

    /// Check the layout's invariants (also needed after deserialising).
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] on a zero degree or out-of-range rank.
    pub fn validate(&self) -> Result<()> {
        if self.tensor_parallelism == 0 || self.pipeline_parallelism == 0 {
            return Err(Error::Configuration(format!(
                "parallel degrees must be > 0 (tp={}, pp={})",
                self.tensor_parallelism, self.pipeline_parallelism
            )));
        }
        if self.rank >= self.world_size() {
            return Err(Error::Configuration(format!(
                "rank {} out of range for world size {}",
                self.rank,
                self.world_size()
            )));
        }
        Ok(())
    }

    /// Total number of ranks in the group.
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.tensor_parallelism * self.pipeline_parallelism
    }

    /// Rank within this pipeline stage's tensor-parallel group.
    #[must_use]
    pub fn tensor_rank(&self) -> usize {
        self.rank % self.tensor_parallelism
    }

    /// Index of the pipeline stage this rank belongs to.
    #[must_use]
    pub fn pipeline_rank(&self) -> usize {
        self.rank / self.tensor_parallelism
    }

    #[must_use]
    pub fn is_pipeline_parallel(&self) -> bool {
        self.pipeline_parallelism > 1
    }

    #[must_use]
    pub fn is_tensor_parallel(&self) -> bool {
        self.tensor_parallelism > 1
    }

    /// Whether this rank holds the first pipeline stage (embeddings; the
    /// rank that receives the finalised output ids).
    #[must_use]
    pub fn is_first_pipeline_rank(&self) -> bool {
        self.pipeline_rank() == 0
    }

    /// Whether this rank holds the final pipeline stage (logits; the rank
    /// that samples).
    #[must_use]
    pub fn is_last_pipeline_rank(&self) -> bool {
        self.pipeline_rank() + 1 == self.pipeline_parallelism
    }

    /// Global rank of pipeline stage `stage` that shares this rank's tensor
    /// rank.
    #[must_use]
    pub fn stage_rank(&self, stage: usize) -> usize {
        stage * self.tensor_parallelism + self.tensor_rank()
    }

    /// Global rank of the first-stage peer.
    #[must_use]
    pub fn first_pipeline_rank(&self) -> usize {
        self.stage_rank(0)
    }

    /// Global rank of the last-stage peer.
    #[must_use]
    pub fn last_pipeline_rank(&self) -> usize {
        self.stage_rank(self.pipeline_parallelism - 1)
    }

    /// Global ranks of every other pipeline stage sharing this tensor rank,
    /// in stage order.
    #[must_use]
    pub fn pipeline_peers(&self) -> Vec<usize> {
        (0..self.pipeline_parallelism)
            .map(|stage| self.stage_rank(stage))
            .filter(|&r| r != self.rank)
            .collect()
    }

    /// Contiguous range of transformer layers held by this rank's stage.
    ///
    /// Layers are split evenly; the last stage absorbs any remainder.
    #[must_use]
    pub fn layers_for_stage(&self, num_layers: usize) -> Range<usize> {
        let per_stage = num_layers / self.pipeline_parallelism;
        let start = self.pipeline_rank() * per_stage;
        let end = if self.is_last_pipeline_rank() {
            num_layers
        } else {
            start + per_stage
        };
        start..end
    }
}

impl Default for WorldLayout {
    fn default() -> Self {
        Self::single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_layout() {
        let world = WorldLayout::single();
        assert_eq!(world.world_size(), 1);
        assert!(world.is_first_pipeline_rank());
        assert!(world.is_last_pipeline_rank());
        assert!(world.pipeline_peers().is_empty());
        assert_eq!(world.first_pipeline_rank(), 0);
        assert_eq!(world.last_pipeline_rank(), 0);
    }

    #[test]
    fn test_stage_major_ranks() {
        // tp=2, pp=3: ranks 0,1 = stage 0; 2,3 = stage 1; 4,5 = stage 2
        let world = WorldLayout::new(2, 3, 3).unwrap();
        assert_eq!(world.tensor_rank(), 1);
        assert_eq!(world.pipeline_rank(), 1);
        assert!(!world.is_first_pipeline_rank());
        assert!(!world.is_last_pipeline_rank());
        assert_eq!(world.first_pipeline_rank(), 1);
        assert_eq!(world.last_pipeline_rank(), 5);
        assert_eq!(world.pipeline_peers(), vec![1, 5]);
    }

    #[test]
    fn test_last_stage_rank() {
        let world = WorldLayout::new(1, 2, 1).unwrap();
        assert!(world.is_last_pipeline_rank());
        assert!(!world.is_first_pipeline_rank());
        assert_eq!(world.pipeline_peers(), vec![0]);
    }

    #[test]
    fn test_invalid_layouts() {
        assert!(WorldLayout::new(0, 1, 0).is_err());
        assert!(WorldLayout::new(1, 0, 0).is_err());
        assert!(WorldLayout::new(2, 2, 4).is_err());
    }

    #[test]
    fn test_layers_for_stage_even() {
        let ranges: Vec<_> = (0..4)
            .map(|r| WorldLayout::new(1, 4, r).unwrap().layers_for_stage(32))
            .collect();
        assert_eq!(ranges, vec![0..8, 8..16, 16..24, 24..32]);
    }

    #[test]
    fn test_layers_for_stage_remainder_on_last() {
        let first = WorldLayout::new(1, 3, 0).unwrap();
        let last = WorldLayout::new(1, 3, 2).unwrap();
        assert_eq!(first.layers_for_stage(22), 0..7);
        assert_eq!(last.layers_for_stage(22), 14..22);
    }

    #[test]
    fn test_deserialize_defaults_device() {
        let world: WorldLayout = serde_json::from_str(
            r#"{ "tensor_parallelism": 1, "pipeline_parallelism": 2, "rank": 1 }"#,
        )
        .unwrap();
        assert_eq!(world.device, 0);
        assert!(world.validate().is_ok());
        assert_eq!(world.with_device(3).device, 3);
    }
}
