//! # lamina-pipeline
//!
//! Pipeline-parallel execution core for decoder-only transformer models:
//! - `Envelope` — arity-tagged inter-stage argument bundle
//! - `MaskResolver` — positional-slot disambiguation and entry-stage mask
//!   materialization
//! - `RecomputePolicy` / `Checkpoint` — two-phase activation recompute
//! - `LayerCatalog` / `StagePartitioner` — layer inventory and stage
//!   segmentation, including interleaved virtual stages
//! - `PipelineModel` — per-worker stage assembly, forward, and loss
//! - `BatchSplitter` — first-stage/last-stage routing of raw data fields

pub mod batch;
pub mod bias;
pub mod catalog;
pub mod config;
pub mod envelope;
pub mod layers;
pub mod loss;
pub mod model;
pub mod partition;
pub mod recompute;
pub mod resolver;
pub mod topology;

pub use batch::{BatchSplitter, FieldValue, PaddingSide, Pooling, RawBatch, StageGroup};
pub use catalog::{LayerCatalog, LayerDescriptor, LayerKind, SharedWeightGroup, WeightRef};
pub use config::{LossKind, PipelineConfig};
pub use envelope::{Envelope, EnvelopeSlots};
pub use layers::{DecoderCore, DecoderStage, EmbeddingStage, HeadStage, NormStage, StageLayer};
pub use loss::{LossFn, IGNORE_INDEX};
pub use model::{PipelineModel, TIED_EMBEDDING_GROUP};
pub use partition::{PartitionPlan, SegmentMethod, SharedConstraint, Stage, StagePartitioner};
pub use recompute::{Checkpoint, Granularity, OpContext, RecomputeConfig, RecomputePolicy};
pub use resolver::MaskResolver;
pub use topology::Topology;
