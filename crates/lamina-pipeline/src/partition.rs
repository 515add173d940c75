//! Slicing the layer catalog into contiguous stages.
//!
//! The partitioner prefers boundary-aligned segmentation that keeps each
//! repeatable decoder block whole within one chunk, and falls back to
//! uniform segmentation when the block count does not divide across the
//! requested chunks. Shared-weight groups whose members land on different
//! stages are emitted as replication constraints for the owning runtime;
//! the partitioner never resolves them itself.

use tracing::{debug, info, warn};

use lamina_core::{LaminaError, Result};

use crate::catalog::{LayerCatalog, LayerDescriptor, LayerKind};
use crate::topology::Topology;

/// Segmentation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMethod {
    /// Spread all catalog entries evenly (sizes differ by at most one).
    Uniform,
    /// Keep layers of the given kind whole per chunk; leading non-boundary
    /// entries attach to the first chunk, trailing ones to the last.
    Boundary(LayerKind),
}

/// A contiguous slice of the catalog assigned to one worker.
#[derive(Debug, Clone)]
pub struct Stage {
    /// Pipeline stage rank executing this chunk.
    pub rank: usize,
    /// Virtual chunk index; equals `rank` without virtual stages.
    pub chunk: usize,
    /// The descriptors, in catalog order.
    pub layers: Vec<LayerDescriptor>,
}

/// A shared-weight group spanning more than one stage. The runtime must
/// replicate the tensor of record on every listed stage and sum its
/// gradient contributions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedConstraint {
    pub group: String,
    pub stage_ranks: Vec<usize>,
}

/// Result of partitioning: the ordered chunks plus cross-stage constraints.
#[derive(Debug)]
pub struct PartitionPlan {
    pub stages: Vec<Stage>,
    pub shared_constraints: Vec<SharedConstraint>,
}

impl PartitionPlan {
    /// Chunks owned by the given stage rank, in execution order.
    pub fn chunks_for(&self, rank: usize) -> Vec<&Stage> {
        self.stages.iter().filter(|s| s.rank == rank).collect()
    }
}

/// Slices a catalog into stages for the given topology.
pub struct StagePartitioner {
    topology: Topology,
}

impl StagePartitioner {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    /// Partition the catalog.
    ///
    /// Produces `stage_count * virtual_stage_multiplier` chunks whose layer
    /// sequences concatenate to the catalog order exactly; chunk `c` is
    /// assigned to stage `c % stage_count` (interleaved placement).
    pub fn partition(
        &self,
        catalog: &LayerCatalog,
        method: SegmentMethod,
    ) -> Result<PartitionPlan> {
        let total = catalog.len();
        let chunks = self.topology.total_chunks();

        if chunks == 0 {
            return Err(LaminaError::InfeasiblePartition(
                "requested zero stages".into(),
            ));
        }
        if chunks > total {
            return Err(LaminaError::InfeasiblePartition(format!(
                "requested {chunks} chunks over {total} layers"
            )));
        }

        let cuts = match method {
            SegmentMethod::Boundary(kind) => match self.boundary_cuts(catalog, kind, chunks) {
                Some(cuts) => cuts,
                None => {
                    warn!(
                        ?kind,
                        chunks, "boundary segmentation infeasible, falling back to uniform"
                    );
                    uniform_cuts(total, chunks)
                }
            },
            SegmentMethod::Uniform => uniform_cuts(total, chunks),
        };

        let stage_count = self.topology.stage_count;
        let descriptors = catalog.descriptors();
        let mut stages = Vec::with_capacity(chunks);
        for (c, window) in cuts.windows(2).enumerate() {
            let (start, end) = (window[0], window[1]);
            let stage = Stage {
                rank: c % stage_count,
                chunk: c,
                layers: descriptors[start..end].to_vec(),
            };
            debug!(
                chunk = c,
                rank = stage.rank,
                layers = stage.layers.len(),
                first = %descriptors[start].name,
                "assigned chunk"
            );
            stages.push(stage);
        }

        let shared_constraints = self.shared_constraints(catalog, &cuts, stage_count);
        for constraint in &shared_constraints {
            info!(
                group = %constraint.group,
                stages = ?constraint.stage_ranks,
                "shared weight group spans stages; runtime must replicate and sum gradients"
            );
        }

        Ok(PartitionPlan {
            stages,
            shared_constraints,
        })
    }

    /// Cut points keeping boundary-kind layers whole per chunk, or None when
    /// the boundary count does not divide evenly.
    fn boundary_cuts(
        &self,
        catalog: &LayerCatalog,
        kind: LayerKind,
        chunks: usize,
    ) -> Option<Vec<usize>> {
        let boundary_idx: Vec<usize> = catalog
            .descriptors()
            .iter()
            .enumerate()
            .filter(|(_, d)| d.kind == kind)
            .map(|(i, _)| i)
            .collect();

        if boundary_idx.is_empty() || boundary_idx.len() % chunks != 0 {
            return None;
        }

        let per_chunk = boundary_idx.len() / chunks;
        let mut cuts = Vec::with_capacity(chunks + 1);
        cuts.push(0);
        for c in 1..chunks {
            // each interior cut lands just before the first boundary layer
            // of the next group
            cuts.push(boundary_idx[c * per_chunk]);
        }
        cuts.push(catalog.len());
        Some(cuts)
    }

    fn shared_constraints(
        &self,
        catalog: &LayerCatalog,
        cuts: &[usize],
        stage_count: usize,
    ) -> Vec<SharedConstraint> {
        let rank_of = |desc_idx: usize| -> usize {
            let chunk = cuts[1..]
                .iter()
                .position(|&end| desc_idx < end)
                .unwrap_or(cuts.len() - 2);
            chunk % stage_count
        };

        let mut constraints = Vec::new();
        let mut group_names: Vec<&str> = catalog.group_names().collect();
        group_names.sort_unstable();
        for name in group_names {
            let group = match catalog.group(name) {
                Some(g) => g,
                None => continue,
            };
            let mut ranks: Vec<usize> = catalog
                .descriptors()
                .iter()
                .enumerate()
                .filter(|(_, d)| group.members().contains(&d.name))
                .map(|(i, _)| rank_of(i))
                .collect();
            ranks.sort_unstable();
            ranks.dedup();
            if ranks.len() > 1 {
                constraints.push(SharedConstraint {
                    group: name.to_string(),
                    stage_ranks: ranks,
                });
            }
        }
        constraints
    }
}

/// Cut points for even spread: sizes differ by at most one, larger chunks
/// first.
fn uniform_cuts(total: usize, chunks: usize) -> Vec<usize> {
    let base = total / chunks;
    let rem = total % chunks;
    let mut cuts = Vec::with_capacity(chunks + 1);
    cuts.push(0);
    let mut at = 0;
    for c in 0..chunks {
        at += base + usize::from(c < rem);
        cuts.push(at);
    }
    cuts
}
