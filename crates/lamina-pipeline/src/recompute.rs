//! Activation recomputation: trade stored activations for a second forward
//! pass during backward.
//!
//! Instead of re-entering a layer's forward as a side effect of backward,
//! recompute is an explicit two-phase contract: [`Checkpoint::capture`]
//! snapshots just enough state to replay, and [`Checkpoint::replay`] is an
//! ordinary call the backward driver makes. Replay must be bit-identical to
//! the original forward, so a checkpoint stores detached deep copies of the
//! layer inputs and the layer math must be deterministic.
//!
//! The reduced-fidelity path keeps the outputs of individually flagged
//! operations from the original forward and replays only the rest.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use lamina_core::{Result, Tensor};

use crate::envelope::EnvelopeSlots;

/// Scope of activation recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Keep all activations, never recompute.
    #[default]
    None,
    /// Recompute whole layers from their stored inputs.
    Full,
    /// Recomputation is managed inside individual operations, not at the
    /// layer boundary; the layer-level policy treats this as off.
    Selective,
}

/// Configuration surface for the recompute policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecomputeConfig {
    pub granularity: Granularity,
    /// Layer indices never recomputed even under `full`.
    #[serde(default)]
    pub excluded_layers: BTreeSet<usize>,
    /// Operation name → keep its output instead of replaying it.
    #[serde(default)]
    pub op_skip: BTreeMap<String, bool>,
}

/// Decides, per layer, whether the forward pass is recomputed during
/// backward and along which path.
#[derive(Debug, Clone, Default)]
pub struct RecomputePolicy {
    config: RecomputeConfig,
}

impl RecomputePolicy {
    pub fn new(config: RecomputeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RecomputeConfig {
        &self.config
    }

    /// Whether the given layer's forward should be recomputed.
    ///
    /// Always false without an upstream gradient dependency: if nothing
    /// flows back through this layer there are no activations worth
    /// dropping.
    pub fn should_recompute(&self, layer_index: usize, has_gradient: bool) -> bool {
        if !has_gradient {
            return false;
        }
        if self.config.excluded_layers.contains(&layer_index) {
            return false;
        }
        matches!(self.config.granularity, Granularity::Full)
    }

    /// Replay path for a layer that is being recomputed.
    pub fn replay_path(&self) -> ReplayPath {
        if self.config.op_skip.values().any(|&v| v) {
            ReplayPath::Reduced
        } else {
            ReplayPath::Full
        }
    }

    /// Whether the named operation's output is kept rather than replayed.
    pub fn op_skipped(&self, name: &str) -> bool {
        self.config.op_skip.get(name).copied().unwrap_or(false)
    }
}

/// Which operations a replay re-executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPath {
    /// Re-run every operation from the stored inputs.
    Full,
    /// Re-run only operations whose outputs were not kept.
    Reduced,
}

/// Operation outputs kept from the original forward for the reduced path.
#[derive(Debug, Default, Clone)]
pub struct OpStash {
    kept: HashMap<String, Tensor>,
}

impl OpStash {
    pub fn keep(&mut self, name: &str, output: Tensor) {
        self.kept.insert(name.to_string(), output);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.kept.get(name)
    }

    pub fn len(&self) -> usize {
        self.kept.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
}

/// Execution context a layer's internal operations run under.
///
/// Layers route every named internal operation through [`OpContext::run_op`]
/// so the same forward code serves the original pass, the recording pass,
/// and the replay.
pub enum OpContext<'a> {
    /// Normal forward: run everything, keep nothing.
    Plain,
    /// Original forward under the reduced path: run everything, keep the
    /// outputs of skipped ops for the later replay.
    Record {
        policy: &'a RecomputePolicy,
        stash: &'a mut OpStash,
    },
    /// Replay: reuse kept outputs, re-run the rest.
    Replay { stash: &'a OpStash },
}

impl OpContext<'_> {
    /// Run (or reuse) one named internal operation.
    pub fn run_op<F>(&mut self, name: &str, f: F) -> Result<Tensor>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        match self {
            OpContext::Plain => f(),
            OpContext::Record { policy, stash } => {
                let out = f()?;
                if policy.op_skipped(name) {
                    stash.keep(name, out.clone());
                }
                Ok(out)
            }
            OpContext::Replay { stash } => match stash.get(name) {
                Some(kept) => Ok(kept.clone()),
                None => f(),
            },
        }
    }
}

/// Snapshot of one layer invocation, sufficient to replay its forward.
///
/// Inputs are stored as detached deep copies: the replay must see exactly
/// the values the original forward saw, even if some stage mutated its
/// working tensors in place afterwards.
pub struct Checkpoint {
    inputs: EnvelopeSlots,
    path: ReplayPath,
    stash: OpStash,
}

impl Checkpoint {
    /// Capture the inputs of a layer forward.
    pub fn capture(inputs: &EnvelopeSlots, path: ReplayPath) -> Self {
        let snap = |t: &Option<Tensor>| t.as_ref().map(|t| t.detach().deep_clone());
        Self {
            inputs: EnvelopeSlots {
                hidden_states: inputs.hidden_states.detach().deep_clone(),
                attention_mask: snap(&inputs.attention_mask),
                row_index_mask: snap(&inputs.row_index_mask),
                position_ids: snap(&inputs.position_ids),
                bias: snap(&inputs.bias),
            },
            path,
            stash: OpStash::default(),
        }
    }

    pub fn path(&self) -> ReplayPath {
        self.path
    }

    /// Stash for the recording pass (reduced path only).
    pub fn stash_mut(&mut self) -> &mut OpStash {
        &mut self.stash
    }

    /// The saved layer inputs.
    pub fn inputs(&self) -> &EnvelopeSlots {
        &self.inputs
    }

    /// Re-execute the layer forward from the stored inputs.
    ///
    /// Called by the backward driver in the same execution context as the
    /// original forward; the closure receives the saved inputs and an
    /// [`OpContext`] that serves kept outputs on the reduced path.
    pub fn replay<F>(&self, forward: F) -> Result<Tensor>
    where
        F: FnOnce(&EnvelopeSlots, &mut OpContext) -> Result<Tensor>,
    {
        let mut ctx = match self.path {
            ReplayPath::Full => OpContext::Plain,
            ReplayPath::Reduced => OpContext::Replay { stash: &self.stash },
        };
        forward(&self.inputs, &mut ctx)
    }
}
