//! Distributed-topology context, passed explicitly to everything that needs
//! rank information. There is no process-wide singleton: a stage owns its
//! `Topology` and hands it to the partitioner, resolver, and model builder.

use serde::{Deserialize, Serialize};

/// Placement of the local worker within the pipeline and tensor-parallel
/// groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// This worker's pipeline stage rank, in `0..stage_count`.
    pub stage_rank: usize,
    /// Number of pipeline stages.
    pub stage_count: usize,
    /// This worker's tensor-parallel rank, in `0..tensor_parallel_degree`.
    pub tensor_parallel_rank: usize,
    /// Tensor-parallel group size (1 when sharding is off).
    pub tensor_parallel_degree: usize,
    /// Virtual-stage multiplier for interleaved scheduling (1 = none).
    pub virtual_stage_multiplier: usize,
}

impl Topology {
    /// Topology for a single worker with no parallelism — the test default.
    pub fn single() -> Self {
        Self {
            stage_rank: 0,
            stage_count: 1,
            tensor_parallel_rank: 0,
            tensor_parallel_degree: 1,
            virtual_stage_multiplier: 1,
        }
    }

    /// A pipeline of `stage_count` stages with no tensor parallelism.
    pub fn pipeline(stage_rank: usize, stage_count: usize) -> Self {
        Self {
            stage_rank,
            stage_count,
            tensor_parallel_rank: 0,
            tensor_parallel_degree: 1,
            virtual_stage_multiplier: 1,
        }
    }

    /// Total number of virtual chunks the catalog is cut into.
    pub fn total_chunks(&self) -> usize {
        self.stage_count * self.virtual_stage_multiplier.max(1)
    }

    /// Whether tensor-parallel sharding is active.
    pub fn tensor_parallel(&self) -> bool {
        self.tensor_parallel_degree > 1
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single() {
        let t = Topology::single();
        assert_eq!(t.stage_count, 1);
        assert!(!t.tensor_parallel());
        assert_eq!(t.total_chunks(), 1);
    }

    #[test]
    fn test_chunks() {
        let mut t = Topology::pipeline(1, 4);
        assert_eq!(t.total_chunks(), 4);
        t.virtual_stage_multiplier = 2;
        assert_eq!(t.total_chunks(), 8);
    }
}
