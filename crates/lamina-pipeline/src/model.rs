//! Pipeline model assembly: catalog construction, partitioning, local stage
//! instantiation, and the forward/loss surface for one worker.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

use lamina_core::{DType, Device, LaminaError, Result, Tensor};

use crate::batch::{BatchSplitter, RawBatch, StageGroup};
use crate::catalog::{LayerCatalog, LayerDescriptor, LayerKind, WeightRef};
use crate::config::PipelineConfig;
use crate::envelope::Envelope;
use crate::layers::{
    DecoderStage, EmbeddingStage, HeadStage, NormStage, ReferenceDecoder, StageLayer,
};
use crate::loss::{loss_for, LossFn};
use crate::partition::{PartitionPlan, SegmentMethod, StagePartitioner};
use crate::recompute::{Checkpoint, RecomputePolicy};
use crate::resolver::MaskResolver;
use crate::topology::Topology;

/// Shared-weight group name used when embeddings are tied to the head.
pub const TIED_EMBEDDING_GROUP: &str = "tied_embeddings";

/// One locally-hosted chunk of consecutive layers.
pub struct LocalChunk {
    chunk: usize,
    layers: Vec<Box<dyn StageLayer>>,
}

impl LocalChunk {
    pub fn chunk(&self) -> usize {
        self.chunk
    }

    pub fn layers(&self) -> &[Box<dyn StageLayer>] {
        &self.layers
    }
}

/// The per-worker view of a pipelined model.
///
/// Construction builds the full layer catalog, partitions it for the given
/// topology, and instantiates only the chunks assigned to this worker's
/// stage rank. The forward surface works envelope-in, envelope-out; the
/// loss applies on the last stage only.
pub struct PipelineModel {
    config: PipelineConfig,
    topology: Topology,
    catalog: LayerCatalog,
    plan: PartitionPlan,
    chunks: Vec<LocalChunk>,
    loss: Box<dyn LossFn>,
}

impl PipelineModel {
    pub fn new(config: PipelineConfig, topology: Topology, device: Device) -> Result<Self> {
        let catalog = build_catalog(&config)?;
        let plan = StagePartitioner::new(topology.clone())
            .partition(&catalog, SegmentMethod::Boundary(LayerKind::Decoder))?;

        // shared tensors of record start zeroed; give them trainable values
        for group_name in catalog.group_names().map(str::to_string).collect::<Vec<_>>() {
            if let Some(group) = catalog.group(&group_name) {
                let tensor = group.tensor();
                let mut record = tensor.write();
                let shape = record.shape().dims().to_vec();
                *record = Tensor::randn(&shape, 0.02);
                record.set_requires_grad(true);
            }
        }

        let resolver = MaskResolver::new(config.position_bias, device, topology.clone());
        let policy = RecomputePolicy::new(config.recompute.clone());

        let mut chunks = Vec::new();
        for stage in plan.chunks_for(topology.stage_rank) {
            let mut layers: Vec<Box<dyn StageLayer>> = Vec::with_capacity(stage.layers.len());
            for desc in &stage.layers {
                layers.push(build_layer(desc, &config, &catalog, &resolver, &policy)?);
            }
            chunks.push(LocalChunk {
                chunk: stage.chunk,
                layers,
            });
        }

        info!(
            stage_rank = topology.stage_rank,
            stage_count = topology.stage_count,
            local_chunks = chunks.len(),
            layers = catalog.len(),
            "assembled pipeline stage"
        );

        let loss = loss_for(config.loss);
        Ok(Self {
            config,
            topology,
            catalog,
            plan,
            chunks,
            loss,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    pub fn catalog(&self) -> &LayerCatalog {
        &self.catalog
    }

    pub fn local_chunks(&self) -> &[LocalChunk] {
        &self.chunks
    }

    /// One-shot weight customization, applied once after assembly.
    ///
    /// Visits every locally-hosted trainable parameter by dotted name;
    /// tied parameters are visited under each member's name and the last
    /// write wins on the shared tensor of record.
    pub fn init_weights(&mut self, f: &mut dyn FnMut(&str, &mut Tensor)) {
        for chunk in &mut self.chunks {
            for layer in &mut chunk.layers {
                layer.visit_parameters(f);
            }
        }
    }

    /// Run one local chunk: decode the inbound envelope, pass the slots
    /// through the chunk's layers, re-encode for the wire.
    pub fn forward_chunk(&self, local_index: usize, envelope: &Envelope) -> Result<Envelope> {
        let chunk = self.chunks.get(local_index).ok_or_else(|| {
            LaminaError::Config(format!(
                "chunk index {local_index} out of range for {} local chunks",
                self.chunks.len()
            ))
        })?;
        let mut slots = envelope.decode()?;
        for layer in &chunk.layers {
            slots = layer.forward(slots)?;
        }
        Ok(Envelope::encode(&slots))
    }

    /// Run every local chunk in chunk order. On a single-stage topology
    /// this is the whole model's forward.
    pub fn forward(&self, envelope: &Envelope) -> Result<Envelope> {
        let mut current = envelope.clone();
        for i in 0..self.chunks.len() {
            current = self.forward_chunk(i, &current)?;
        }
        Ok(current)
    }

    /// Last-stage loss over the head's logits.
    pub fn compute_loss(&self, output: &Envelope, labels: &Tensor) -> Result<Tensor> {
        let slots = output.decode()?;
        self.loss.compute(&slots.hidden_states, labels)
    }

    /// Drain recompute tokens captured by the most recent forward, in layer
    /// order, for the backward driver.
    pub fn take_checkpoints(&self) -> Vec<Checkpoint> {
        self.chunks
            .iter()
            .flat_map(|c| c.layers.iter().filter_map(|l| l.take_checkpoint()))
            .collect()
    }

    /// Tensor ref for a shared-weight group hosted on this stage.
    pub fn weight_of(&self, group: &str) -> Option<WeightRef> {
        self.chunks
            .iter()
            .flat_map(|c| c.layers.iter())
            .find_map(|l| l.weight_of(group))
    }

    /// Split a raw data batch into the first-stage and last-stage fields.
    pub fn split_batch(batch: RawBatch) -> Result<(StageGroup, StageGroup)> {
        BatchSplitter::split(batch)
    }
}

/// Full layer catalog for the configured model, in execution order.
fn build_catalog(config: &PipelineConfig) -> Result<LayerCatalog> {
    let mut catalog = LayerCatalog::new();
    let embed_shape = [config.vocab_size, config.hidden_size];

    let embed = LayerDescriptor::new("model.embed_tokens", LayerKind::Embedding);
    if config.tie_word_embeddings {
        catalog.add_shared_layer(embed, TIED_EMBEDDING_GROUP, &embed_shape, DType::F32)?;
    } else {
        catalog.add_layer(embed);
    }

    for i in 0..config.num_layers {
        catalog.add_layer(
            LayerDescriptor::new(format!("model.layers.{i}"), LayerKind::Decoder)
                .with_layer_index(i),
        );
    }

    catalog.add_layer(LayerDescriptor::new("model.norm", LayerKind::FinalNorm));

    let head = LayerDescriptor::new("lm_head", LayerKind::Head);
    if config.tie_word_embeddings {
        catalog.add_shared_layer(head, TIED_EMBEDDING_GROUP, &embed_shape, DType::F32)?;
    } else {
        catalog.add_layer(head);
    }

    Ok(catalog)
}

fn projection_weight(
    desc: &LayerDescriptor,
    config: &PipelineConfig,
    catalog: &LayerCatalog,
) -> WeightRef {
    match desc.shared_group.as_deref().and_then(|g| catalog.group(g)) {
        Some(group) => group.tensor(),
        None => {
            let mut w = Tensor::randn(&[config.vocab_size, config.hidden_size], 0.02);
            w.set_requires_grad(true);
            Arc::new(RwLock::new(w))
        }
    }
}

fn build_layer(
    desc: &LayerDescriptor,
    config: &PipelineConfig,
    catalog: &LayerCatalog,
    resolver: &MaskResolver,
    policy: &RecomputePolicy,
) -> Result<Box<dyn StageLayer>> {
    Ok(match desc.kind {
        LayerKind::Embedding => Box::new(EmbeddingStage::new(
            desc,
            config,
            resolver.clone(),
            projection_weight(desc, config, catalog),
        )),
        LayerKind::Decoder => Box::new(DecoderStage::new(
            desc,
            Box::new(ReferenceDecoder::new(desc, config)),
            resolver.clone(),
            policy.clone(),
        )),
        LayerKind::FinalNorm => Box::new(NormStage::new(desc, config)),
        LayerKind::Head => Box::new(HeadStage::new(
            desc,
            config,
            projection_weight(desc, config, catalog),
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeSlots;
    use crate::recompute::Granularity;

    fn model(config: PipelineConfig) -> PipelineModel {
        PipelineModel::new(config, Topology::single(), Device::Cpu).unwrap()
    }

    fn input_envelope() -> Envelope {
        let mut slots = EnvelopeSlots::bare(Tensor::from_i64(&[1, 2, 3, 4], &[1, 4]));
        slots.attention_mask = Some(Tensor::from_bool(&[true; 4], &[1, 4]));
        Envelope::encode(&slots)
    }

    #[test]
    fn test_catalog_layout() {
        let config = PipelineConfig::tiny();
        let catalog = build_catalog(&config).unwrap();
        // embedding + decoders + norm + head
        assert_eq!(catalog.len(), config.num_layers + 3);
        assert_eq!(catalog.descriptors()[0].kind, LayerKind::Embedding);
        assert_eq!(
            catalog.descriptors().last().unwrap().kind,
            LayerKind::Head
        );
    }

    #[test]
    fn test_single_stage_forward_produces_logits() {
        let config = PipelineConfig::tiny();
        let vocab = config.vocab_size;
        let m = model(config);
        let out = m.forward(&input_envelope()).unwrap();
        let slots = out.decode().unwrap();
        assert_eq!(slots.hidden_states.shape().dims(), &[4, vocab]);
        // norm stage dropped the aux slots
        assert_eq!(out.arity(), 1);
    }

    #[test]
    fn test_loss_from_forward() {
        let m = model(PipelineConfig::tiny());
        let out = m.forward(&input_envelope()).unwrap();
        let labels = Tensor::from_i64(&[2, 3, 4, 5], &[4]);
        let loss = m.compute_loss(&out, &labels).unwrap();
        assert!(loss.as_f32_slice().unwrap()[0].is_finite());
    }

    #[test]
    fn test_tied_weights_share_storage() {
        let mut config = PipelineConfig::tiny();
        config.tie_word_embeddings = true;
        let m = model(config);

        let shared = m.weight_of(TIED_EMBEDDING_GROUP).expect("tied group hosted");
        shared.write().as_f32_slice_mut().unwrap()[0] = 7.0;

        // both stage-level accessors observe the same tensor of record
        let group = m.catalog().group(TIED_EMBEDDING_GROUP).unwrap();
        assert_eq!(group.tensor().read().as_f32_slice().unwrap()[0], 7.0);
        assert_eq!(group.members().len(), 2);
    }

    #[test]
    fn test_tied_constraint_emitted_across_stages() {
        let mut config = PipelineConfig::tiny();
        config.tie_word_embeddings = true;
        let m = PipelineModel::new(config, Topology::pipeline(0, 2), Device::Cpu).unwrap();
        let constraints = &m.plan().shared_constraints;
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].group, TIED_EMBEDDING_GROUP);
        assert_eq!(constraints[0].stage_ranks, vec![0, 1]);
    }

    #[test]
    fn test_two_stage_chunks_compose_to_full_forward() {
        let config = PipelineConfig::tiny();
        let first = PipelineModel::new(config.clone(), Topology::pipeline(0, 2), Device::Cpu)
            .unwrap();
        let last = PipelineModel::new(config, Topology::pipeline(1, 2), Device::Cpu).unwrap();
        assert_eq!(first.local_chunks().len(), 1);
        assert_eq!(last.local_chunks().len(), 1);

        let wire = first.forward_chunk(0, &input_envelope()).unwrap();
        let out = last.forward_chunk(0, &wire).unwrap();
        let slots = out.decode().unwrap();
        assert_eq!(slots.hidden_states.shape().dims()[1], last.config().vocab_size);
    }

    #[test]
    fn test_recompute_tokens_collected() {
        let mut config = PipelineConfig::tiny();
        config.recompute.granularity = Granularity::Full;
        let mut m = model(config.clone());
        // make embedding output carry a gradient dependency
        m.init_weights(&mut |name, t| {
            if name == "model.embed_tokens.weight" {
                t.set_requires_grad(true);
            }
        });

        let _ = m.forward(&input_envelope()).unwrap();
        let tokens = m.take_checkpoints();
        assert_eq!(tokens.len(), config.num_layers);
        // drained
        assert!(m.take_checkpoints().is_empty());
    }

    #[test]
    fn test_init_weights_visits_all_parameters() {
        let mut m = model(PipelineConfig::tiny());
        let mut names = Vec::new();
        m.init_weights(&mut |name, _| names.push(name.to_string()));
        assert!(names.contains(&"model.embed_tokens.weight".to_string()));
        assert!(names.contains(&"model.norm.weight".to_string()));
        assert!(names.contains(&"lm_head.weight".to_string()));
        assert!(names.iter().any(|n| n.starts_with("model.layers.0.")));
    }
}
