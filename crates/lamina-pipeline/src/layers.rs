//! Pipeline-stage layer wrappers.
//!
//! Every wrapper speaks the envelope protocol on both sides: it decodes the
//! named slots, runs its math, and hands the slots to the next stage. The
//! decoder wrapper composes an opaque [`DecoderCore`] rather than inheriting
//! from it, so envelope handling and layer math never mix; swapping in a
//! production attention block means implementing one trait.
//!
//! Shared weights are reached through the explicit [`StageLayer::weight_of`]
//! accessor — a stage asks a layer for a group's tensor ref by name instead
//! of probing attributes.

use parking_lot::Mutex;

use lamina_core::{LaminaError, Result, Tensor};

use crate::catalog::{LayerDescriptor, WeightRef};
use crate::config::PipelineConfig;
use crate::envelope::EnvelopeSlots;
use crate::recompute::{Checkpoint, OpContext, RecomputePolicy, ReplayPath};
use crate::resolver::MaskResolver;

/// A layer participating in the pipeline.
pub trait StageLayer: Send + Sync {
    /// Dotted parameter-name prefix, from the catalog descriptor.
    fn name(&self) -> &str;

    /// Consume the inbound slots, produce the outbound slots.
    fn forward(&self, slots: EnvelopeSlots) -> Result<EnvelopeSlots>;

    /// Tensor ref for a shared-weight group this layer is bound to.
    fn weight_of(&self, group: &str) -> Option<WeightRef> {
        let _ = group;
        None
    }

    /// Visit every trainable parameter (used by the one-shot weight init).
    fn visit_parameters(&mut self, f: &mut dyn FnMut(&str, &mut Tensor));

    /// Pending recompute token captured by the last forward, if any.
    fn take_checkpoint(&self) -> Option<Checkpoint> {
        None
    }
}

/// Named optional arguments a decoder core receives.
pub struct DecoderArgs<'a> {
    pub attention_mask: Option<&'a Tensor>,
    pub row_index_mask: Option<&'a Tensor>,
    pub position_ids: Option<&'a Tensor>,
    pub bias: Option<&'a Tensor>,
}

impl<'a> DecoderArgs<'a> {
    fn from_slots(slots: &'a EnvelopeSlots) -> Self {
        Self {
            attention_mask: slots.attention_mask.as_ref(),
            row_index_mask: slots.row_index_mask.as_ref(),
            position_ids: slots.position_ids.as_ref(),
            bias: slots.bias.as_ref(),
        }
    }
}

/// Opaque layer math: `[batch, seq, hidden] -> [batch, seq, hidden]`.
///
/// Must be deterministic — the recompute replay re-runs it from stored
/// inputs and expects bit-identical output. Internal operations are routed
/// through the [`OpContext`] so the reduced replay path can reuse kept
/// outputs.
pub trait DecoderCore: Send + Sync {
    fn forward(
        &self,
        hidden_states: &Tensor,
        args: &DecoderArgs<'_>,
        ctx: &mut OpContext<'_>,
    ) -> Result<Tensor>;

    fn visit_parameters(&mut self, f: &mut dyn FnMut(&str, &mut Tensor));
}

// =============================================================================
// Embedding stage
// =============================================================================

/// First stage: token ids → embeddings, plus mask/bias materialization.
pub struct EmbeddingStage {
    name: String,
    resolver: MaskResolver,
    weight: WeightRef,
    shared_group: Option<String>,
    vocab_size: usize,
    hidden_size: usize,
    num_heads: usize,
}

impl EmbeddingStage {
    pub fn new(
        descriptor: &LayerDescriptor,
        config: &PipelineConfig,
        resolver: MaskResolver,
        weight: WeightRef,
    ) -> Self {
        Self {
            name: descriptor.name.clone(),
            resolver,
            weight,
            shared_group: descriptor.shared_group.clone(),
            vocab_size: config.vocab_size,
            hidden_size: config.hidden_size,
            num_heads: config.num_attention_heads,
        }
    }

    fn lookup(&self, ids: &Tensor) -> Result<Tensor> {
        let id_data = ids
            .as_i64_slice()
            .ok_or(LaminaError::UnsupportedDType(ids.dtype()))?;
        let weight = self.weight.read();
        let w = weight
            .as_f32_slice()
            .ok_or(LaminaError::UnsupportedDType(weight.dtype()))?;

        let dim = self.hidden_size;
        let mut out = vec![0.0f32; id_data.len() * dim];
        for (i, &id) in id_data.iter().enumerate() {
            let id = id as usize;
            if id >= self.vocab_size {
                return Err(LaminaError::Config(format!(
                    "token id {id} out of range for vocab of {}",
                    self.vocab_size
                )));
            }
            out[i * dim..(i + 1) * dim].copy_from_slice(&w[id * dim..(id + 1) * dim]);
        }

        let mut dims: Vec<usize> = ids.shape().dims().to_vec();
        dims.push(dim);
        let mut embeds =
            Tensor::from_f32(&out, &[id_data.len() * dim]).reshape(
                &dims.iter().map(|&d| d as isize).collect::<Vec<_>>(),
            )?;
        embeds.set_requires_grad(weight.requires_grad());
        Ok(embeds)
    }
}

impl StageLayer for EmbeddingStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, slots: EnvelopeSlots) -> Result<EnvelopeSlots> {
        let resolved = self.resolver.resolve(slots);

        // hidden_states carries raw token ids at the pipeline entry
        let ids = resolved.hidden_states.clone();
        let dims = ids.shape().dims();
        let (batch, seq) = match dims {
            [s] => (1, *s),
            [b, s] => (*b, *s),
            _ => {
                return Err(LaminaError::ShapeMismatch {
                    expected: vec![0, 0],
                    got: dims.to_vec(),
                })
            }
        };

        let embeds = self.lookup(&ids)?;
        let entry = EnvelopeSlots {
            hidden_states: embeds,
            ..resolved
        };
        self.resolver
            .materialize_entry(entry, batch, seq, self.num_heads)
    }

    fn weight_of(&self, group: &str) -> Option<WeightRef> {
        match &self.shared_group {
            Some(g) if g == group => Some(self.weight.clone()),
            _ => None,
        }
    }

    fn visit_parameters(&mut self, f: &mut dyn FnMut(&str, &mut Tensor)) {
        let name = format!("{}.weight", self.name);
        f(&name, &mut self.weight.write());
    }
}

// =============================================================================
// Decoder stage
// =============================================================================

/// Middle stage: one decoder block, wrapped with mask resolution and the
/// recompute policy.
pub struct DecoderStage {
    name: String,
    layer_index: usize,
    core: Box<dyn DecoderCore>,
    resolver: MaskResolver,
    policy: RecomputePolicy,
    /// Token captured during forward, handed to the backward driver.
    pending: Mutex<Option<Checkpoint>>,
}

impl DecoderStage {
    pub fn new(
        descriptor: &LayerDescriptor,
        core: Box<dyn DecoderCore>,
        resolver: MaskResolver,
        policy: RecomputePolicy,
    ) -> Self {
        Self {
            name: descriptor.name.clone(),
            layer_index: descriptor.params.layer_index.unwrap_or(0),
            core,
            resolver,
            policy,
            pending: Mutex::new(None),
        }
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    /// Replay this layer's forward from a previously captured checkpoint.
    ///
    /// The backward driver calls this between the stored token and gradient
    /// propagation; output is bit-identical to the original forward.
    pub fn replay(&self, token: &Checkpoint) -> Result<Tensor> {
        token.replay(|inputs, ctx| {
            let args = DecoderArgs::from_slots(inputs);
            self.core.forward(&inputs.hidden_states, &args, ctx)
        })
    }
}

impl StageLayer for DecoderStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, slots: EnvelopeSlots) -> Result<EnvelopeSlots> {
        let resolved = self.resolver.resolve(slots);
        let has_gradient = resolved.hidden_states.requires_grad();

        let mut output = if self.policy.should_recompute(self.layer_index, has_gradient) {
            // snapshot exactly the named arguments the original forward sees,
            // so the replay reproduces the call bit for bit
            let mut token = Checkpoint::capture(&resolved, self.policy.replay_path());
            let args = DecoderArgs::from_slots(&resolved);
            let out = match token.path() {
                ReplayPath::Full => {
                    let mut ctx = OpContext::Plain;
                    self.core.forward(&resolved.hidden_states, &args, &mut ctx)?
                }
                ReplayPath::Reduced => {
                    let mut ctx = OpContext::Record {
                        policy: &self.policy,
                        stash: token.stash_mut(),
                    };
                    self.core.forward(&resolved.hidden_states, &args, &mut ctx)?
                }
            };
            *self.pending.lock() = Some(token);
            out
        } else {
            let args = DecoderArgs::from_slots(&resolved);
            let mut ctx = OpContext::Plain;
            self.core.forward(&resolved.hidden_states, &args, &mut ctx)?
        };

        output.set_requires_grad(has_gradient);
        Ok(EnvelopeSlots {
            hidden_states: output,
            ..resolved
        })
    }

    fn visit_parameters(&mut self, f: &mut dyn FnMut(&str, &mut Tensor)) {
        self.core.visit_parameters(f);
    }

    fn take_checkpoint(&self) -> Option<Checkpoint> {
        self.pending.lock().take()
    }
}

// =============================================================================
// Final norm stage
// =============================================================================

/// Next-to-last stage: final RMS norm. Drops every auxiliary slot — only
/// activations continue to the head.
pub struct NormStage {
    name: String,
    gain: Tensor,
    eps: f32,
    hidden_size: usize,
}

impl NormStage {
    pub fn new(descriptor: &LayerDescriptor, config: &PipelineConfig) -> Self {
        Self {
            name: descriptor.name.clone(),
            gain: Tensor::from_f32(&vec![1.0; config.hidden_size], &[config.hidden_size]),
            eps: config.norm_eps,
            hidden_size: config.hidden_size,
        }
    }
}

impl StageLayer for NormStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, slots: EnvelopeSlots) -> Result<EnvelopeSlots> {
        let hidden = &slots.hidden_states;
        let rows = hidden.numel() / self.hidden_size;
        let flat = hidden.reshape(&[rows as isize, self.hidden_size as isize])?;
        let mut normed = flat
            .rms_norm(&self.gain, self.eps)?
            .reshape(
                &hidden
                    .shape()
                    .dims()
                    .iter()
                    .map(|&d| d as isize)
                    .collect::<Vec<_>>(),
            )?;
        normed.set_requires_grad(hidden.requires_grad());
        Ok(EnvelopeSlots::bare(normed))
    }

    fn visit_parameters(&mut self, f: &mut dyn FnMut(&str, &mut Tensor)) {
        let name = format!("{}.weight", self.name);
        f(&name, &mut self.gain);
    }
}

// =============================================================================
// Head stage
// =============================================================================

/// Last stage: project hidden states onto the vocabulary.
///
/// The projection weight is `[vocab, hidden]`, matching the embedding table
/// layout so the two can share one tensor of record when embeddings are
/// tied.
pub struct HeadStage {
    name: String,
    weight: WeightRef,
    shared_group: Option<String>,
    vocab_size: usize,
    hidden_size: usize,
}

impl HeadStage {
    pub fn new(descriptor: &LayerDescriptor, config: &PipelineConfig, weight: WeightRef) -> Self {
        Self {
            name: descriptor.name.clone(),
            weight,
            shared_group: descriptor.shared_group.clone(),
            vocab_size: config.vocab_size,
            hidden_size: config.hidden_size,
        }
    }
}

impl StageLayer for HeadStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, slots: EnvelopeSlots) -> Result<EnvelopeSlots> {
        let hidden = &slots.hidden_states;
        let dim = self.hidden_size;
        let rows = hidden.numel() / dim;
        let x = hidden.reshape(&[rows as isize, dim as isize])?;
        let x_data = x
            .as_f32_slice()
            .ok_or(LaminaError::UnsupportedDType(x.dtype()))?;

        let weight = self.weight.read();
        let w = weight
            .as_f32_slice()
            .ok_or(LaminaError::UnsupportedDType(weight.dtype()))?;

        // logits = x · Wᵀ with W laid out [vocab, hidden]
        let mut logits = vec![0.0f32; rows * self.vocab_size];
        for r in 0..rows {
            for v in 0..self.vocab_size {
                let mut acc = 0.0f32;
                for h in 0..dim {
                    acc += x_data[r * dim + h] * w[v * dim + h];
                }
                logits[r * self.vocab_size + v] = acc;
            }
        }

        let mut out = Tensor::from_f32(&logits, &[rows, self.vocab_size]);
        out.set_requires_grad(hidden.requires_grad() || weight.requires_grad());
        Ok(EnvelopeSlots::bare(out))
    }

    fn weight_of(&self, group: &str) -> Option<WeightRef> {
        match &self.shared_group {
            Some(g) if g == group => Some(self.weight.clone()),
            _ => None,
        }
    }

    fn visit_parameters(&mut self, f: &mut dyn FnMut(&str, &mut Tensor)) {
        let name = format!("{}.weight", self.name);
        f(&name, &mut self.weight.write());
    }
}

// =============================================================================
// Reference decoder core
// =============================================================================

/// Deterministic stand-in for a production attention block.
///
/// Attention is masked mean pooling over visible positions followed by a
/// linear mix; the MLP is a normed tanh mix. Enough structure to exercise
/// masks, residuals, and the recompute paths without optimized kernels.
pub struct ReferenceDecoder {
    name: String,
    hidden_size: usize,
    eps: f32,
    attn_gain: Tensor,
    attn_weight: Tensor,
    mlp_gain: Tensor,
    mlp_weight: Tensor,
}

impl ReferenceDecoder {
    pub fn new(descriptor: &LayerDescriptor, config: &PipelineConfig) -> Self {
        let h = config.hidden_size;
        Self {
            name: descriptor.name.clone(),
            hidden_size: h,
            eps: config.norm_eps,
            attn_gain: Tensor::from_f32(&vec![1.0; h], &[h]),
            attn_weight: Tensor::randn(&[h, h], 0.02),
            mlp_gain: Tensor::from_f32(&vec![1.0; h], &[h]),
            mlp_weight: Tensor::randn(&[h, h], 0.02),
        }
    }

    /// Mean over positions each query may attend to.
    ///
    /// Visibility comes from the dense additive mask ([b, 1, s, s] floats,
    /// -inf = blocked), the restricted backend's boolean mask ([s, s]), or
    /// defaults to causal when no mask arrived. A float mask that was never
    /// densified by the entry stage is a protocol violation and fails
    /// eagerly.
    fn pool(
        &self,
        normed: &[f32],
        batch: usize,
        seq: usize,
        mask: Option<&Tensor>,
    ) -> Result<Vec<f32>> {
        if let Some(m) = mask {
            if m.as_f32_slice().is_some() && m.numel() != batch * seq * seq {
                return Err(LaminaError::ShapeMismatch {
                    expected: vec![batch, 1, seq, seq],
                    got: m.shape().dims().to_vec(),
                });
            }
            if m.as_bool_slice().is_some() && m.numel() != seq * seq {
                return Err(LaminaError::ShapeMismatch {
                    expected: vec![seq, seq],
                    got: m.shape().dims().to_vec(),
                });
            }
        }

        let dim = self.hidden_size;
        let visible = |b: usize, i: usize, j: usize| -> bool {
            match mask {
                Some(m) => {
                    if let Some(f) = m.as_f32_slice() {
                        f[(b * seq + i) * seq + j] == 0.0
                    } else if let Some(bools) = m.as_bool_slice() {
                        bools[i * seq + j]
                    } else {
                        j <= i
                    }
                }
                None => j <= i,
            }
        };

        let mut out = vec![0.0f32; batch * seq * dim];
        for b in 0..batch {
            for i in 0..seq {
                let mut count = 0usize;
                let row = &mut out[(b * seq + i) * dim..(b * seq + i + 1) * dim];
                for j in 0..seq {
                    if visible(b, i, j) {
                        count += 1;
                        let src = &normed[(b * seq + j) * dim..(b * seq + j + 1) * dim];
                        for (acc, &v) in row.iter_mut().zip(src) {
                            *acc += v;
                        }
                    }
                }
                if count > 0 {
                    let inv = 1.0 / count as f32;
                    for v in row.iter_mut() {
                        *v *= inv;
                    }
                }
            }
        }
        Ok(out)
    }
}

impl DecoderCore for ReferenceDecoder {
    fn forward(
        &self,
        hidden_states: &Tensor,
        args: &DecoderArgs<'_>,
        ctx: &mut OpContext<'_>,
    ) -> Result<Tensor> {
        let dims = hidden_states.shape().dims().to_vec();
        let dim = self.hidden_size;
        let rows = hidden_states.numel() / dim;
        let (batch, seq) = match dims.as_slice() {
            [b, s, _] => (*b, *s),
            [s, _] => (1, *s),
            _ => {
                return Err(LaminaError::ShapeMismatch {
                    expected: vec![0, 0, dim],
                    got: dims,
                })
            }
        };

        let flat = hidden_states.reshape(&[rows as isize, dim as isize])?;

        let attn = ctx.run_op("attention", || {
            let normed = flat.rms_norm(&self.attn_gain, self.eps)?;
            let pooled = self.pool(
                normed.as_f32_slice().expect("rms_norm output is f32"),
                batch,
                seq,
                args.attention_mask,
            )?;
            Tensor::from_f32(&pooled, &[rows, dim]).matmul2d(&self.attn_weight)
        })?;
        let mid = flat.add(&attn)?;

        let mlp = ctx.run_op("mlp", || {
            mid.rms_norm(&self.mlp_gain, self.eps)?
                .matmul2d(&self.mlp_weight)?
                .tanh()
        })?;
        let out = mid.add(&mlp)?;

        out.reshape(&dims.iter().map(|&d| d as isize).collect::<Vec<_>>())
    }

    fn visit_parameters(&mut self, f: &mut dyn FnMut(&str, &mut Tensor)) {
        f(&format!("{}.attn_norm.weight", self.name), &mut self.attn_gain);
        f(&format!("{}.attn.weight", self.name), &mut self.attn_weight);
        f(&format!("{}.mlp_norm.weight", self.name), &mut self.mlp_gain);
        f(&format!("{}.mlp.weight", self.name), &mut self.mlp_weight);
    }
}
