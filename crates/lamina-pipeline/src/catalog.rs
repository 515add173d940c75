//! Ordered registry of layer descriptors and shared-weight groups.
//!
//! The catalog is the single source of truth the partitioner slices: an
//! ordered list of descriptors (kind + constructor parameters + dotted name
//! prefix) plus named shared-weight groups tying descriptors on different
//! stages to one tensor of record.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use lamina_core::{DType, LaminaError, Result, Tensor};

/// Reference to a shared weight: every binding observes the same values.
pub type WeightRef = Arc<RwLock<Tensor>>;

/// Kind tag for a catalog entry. The partitioner's boundary hint names one
/// of these as the repeatable-block marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Embedding,
    Decoder,
    FinalNorm,
    Head,
}

/// Constructor parameters a descriptor carries beyond the shared model
/// config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerParams {
    /// Index among decoder layers, used by the recompute exclusion set.
    pub layer_index: Option<usize>,
}

/// One entry in the catalog. Immutable once the catalog is built.
#[derive(Debug, Clone)]
pub struct LayerDescriptor {
    /// Dotted name prefix for this layer's parameters, e.g. `model.layers.3`.
    pub name: String,
    pub kind: LayerKind,
    pub params: LayerParams,
    /// Shared-weight group this descriptor is bound to, if any.
    pub shared_group: Option<String>,
}

impl LayerDescriptor {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: LayerParams::default(),
            shared_group: None,
        }
    }

    pub fn with_layer_index(mut self, index: usize) -> Self {
        self.params.layer_index = Some(index);
        self
    }
}

/// A named binding of two or more descriptors to one logical weight tensor.
pub struct SharedWeightGroup {
    name: String,
    tensor: WeightRef,
    members: Vec<String>,
}

impl SharedWeightGroup {
    /// The tensor of record. Cloning the ref shares the lock, not the data.
    pub fn tensor(&self) -> WeightRef {
        Arc::clone(&self.tensor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptor names bound to this group, in catalog order.
    pub fn members(&self) -> &[String] {
        &self.members
    }
}

/// Ordered registry of layer descriptors with shared-weight bookkeeping.
#[derive(Default)]
pub struct LayerCatalog {
    descriptors: Vec<LayerDescriptor>,
    groups: HashMap<String, SharedWeightGroup>,
}

impl LayerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a descriptor with no shared weights.
    pub fn add_layer(&mut self, descriptor: LayerDescriptor) {
        self.descriptors.push(descriptor);
    }

    /// Append a descriptor bound to a shared-weight group.
    ///
    /// The first binding creates the tensor of record with the declared
    /// shape and dtype; every later binding must declare the identical
    /// shape and dtype or catalog construction fails. Shape mismatches are
    /// never deferred to runtime.
    pub fn add_shared_layer(
        &mut self,
        mut descriptor: LayerDescriptor,
        group: &str,
        shape: &[usize],
        dtype: DType,
    ) -> Result<()> {
        match self.groups.get_mut(group) {
            Some(existing) => {
                let record = existing.tensor.read();
                if record.shape().dims() != shape {
                    return Err(LaminaError::SharedWeightMismatch {
                        group: group.to_string(),
                        msg: format!(
                            "'{}' declares shape {:?}, tensor of record is {:?}",
                            descriptor.name,
                            shape,
                            record.shape().dims()
                        ),
                    });
                }
                if record.dtype() != dtype {
                    return Err(LaminaError::SharedWeightMismatch {
                        group: group.to_string(),
                        msg: format!(
                            "'{}' declares dtype {}, tensor of record is {}",
                            descriptor.name,
                            dtype,
                            record.dtype()
                        ),
                    });
                }
                drop(record);
                existing.members.push(descriptor.name.clone());
            }
            None => {
                self.groups.insert(
                    group.to_string(),
                    SharedWeightGroup {
                        name: group.to_string(),
                        tensor: Arc::new(RwLock::new(Tensor::zeros(shape, dtype))),
                        members: vec![descriptor.name.clone()],
                    },
                );
            }
        }
        descriptor.shared_group = Some(group.to_string());
        self.descriptors.push(descriptor);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[LayerDescriptor] {
        &self.descriptors
    }

    pub fn group(&self, name: &str) -> Option<&SharedWeightGroup> {
        self.groups.get(name)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(|s| s.as_str())
    }

    /// Number of descriptors with the given kind tag.
    pub fn count_kind(&self, kind: LayerKind) -> usize {
        self.descriptors.iter().filter(|d| d.kind == kind).count()
    }
}
