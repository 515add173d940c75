//! Disambiguation of positionally-decoded envelope slots.
//!
//! The wire format identifies slots by arity alone, so the same position can
//! carry different tensors depending on the model variant and backend. The
//! resolver applies a fixed, order-sensitive rule table — a compatibility
//! shim for a multi-version wire format — and the entry stage additionally
//! materializes the dense attention mask and the position bias that
//! downstream layers consume.
//!
//! The table is deliberately kept rule-for-rule compatible with the
//! historical format, including its reliance on element width: an
//! unanticipated dtype/backend combination resolves the same (possibly
//! wrong) way it always did.

use lamina_core::{DType, Device, LaminaError, Result, Tensor};

use crate::bias::{build_position_bias, shard_heads};
use crate::envelope::EnvelopeSlots;
use crate::topology::Topology;

/// Resolves ambiguous envelope slots into their semantic assignments.
#[derive(Debug, Clone)]
pub struct MaskResolver {
    /// Whether the model injects positions as an additive bias.
    position_bias: bool,
    /// Backend the local stage runs on.
    device: Device,
    topology: Topology,
}

impl MaskResolver {
    pub fn new(position_bias: bool, device: Device, topology: Topology) -> Self {
        Self {
            position_bias,
            device,
            topology,
        }
    }

    pub fn position_bias(&self) -> bool {
        self.position_bias
    }

    /// Apply the decision table. First matching rule wins; later rules only
    /// apply when earlier ones did not fire.
    ///
    /// Pure in (bias-variant flag, backend kind, slot dtypes): identical
    /// inputs always produce the identical named assignment.
    pub fn resolve(&self, slots: EnvelopeSlots) -> EnvelopeSlots {
        let EnvelopeSlots {
            hidden_states,
            mut attention_mask,
            mut row_index_mask,
            mut position_ids,
            mut bias,
        } = slots;

        let dtype_of = |t: &Option<Tensor>| t.as_ref().map(|t| t.dtype());

        if self.position_bias
            && bias.is_none()
            && position_ids.is_none()
            && row_index_mask.is_some()
        {
            // arity 3 under the bias variant: the third slot is the bias
            bias = row_index_mask.take();
        } else if self.position_bias
            && bias.is_none()
            && position_ids.is_some()
            && row_index_mask.is_some()
        {
            // arity 4 under the bias variant: slots shift down by one
            bias = position_ids.take();
            position_ids = row_index_mask.take();
        } else if !self.position_bias {
            if self.device.is_accelerated() {
                if dtype_of(&attention_mask) == Some(DType::I32) {
                    // a compact row-index mask travelled in the mask slot;
                    // whatever sat in the row-index slot shifts to position_ids
                    let mask = attention_mask.take();
                    position_ids = row_index_mask.take();
                    row_index_mask = mask;
                } else if dtype_of(&attention_mask) == Some(DType::I64) {
                    position_ids = attention_mask.take();
                    row_index_mask = None;
                } else if dtype_of(&row_index_mask) == Some(DType::I64) {
                    position_ids = row_index_mask.take();
                }
            } else if position_ids.is_none() && row_index_mask.is_some() {
                position_ids = row_index_mask.take();
            }
        }

        EnvelopeSlots {
            hidden_states,
            attention_mask,
            row_index_mask,
            position_ids,
            bias,
        }
    }

    /// Entry-stage materialization, run by the first stage after resolution.
    ///
    /// Builds the dense causal/padding attention mask when the arriving
    /// envelope carried only a boolean padding mask (or nothing), fabricates
    /// the lower-triangular mask on the restricted backend, and rebuilds the
    /// position bias from scratch when the bias variant is active.
    ///
    /// `batch`/`seq` come from the raw input ids, which only the first stage
    /// sees.
    pub fn materialize_entry(
        &self,
        slots: EnvelopeSlots,
        batch: usize,
        seq: usize,
        num_heads: usize,
    ) -> Result<EnvelopeSlots> {
        let EnvelopeSlots {
            hidden_states,
            attention_mask,
            row_index_mask,
            position_ids,
            ..
        } = slots;

        // Inbound bias is discarded: the entry stage is the tensor's origin.
        let mut bias = None;
        if self.position_bias {
            if row_index_mask.is_some() {
                return Err(LaminaError::InvalidEnvelope(
                    "bias and row_index_mask can not be set at same time".into(),
                ));
            }
            let padding = match &attention_mask {
                Some(m) => m.to_bool()?,
                None => Tensor::ones_bool(&[batch, seq]),
            };
            let full = build_position_bias(&padding, num_heads)?;
            let mut sharded = shard_heads(&full, &self.topology)?;
            sharded.set_requires_grad(false);
            bias = Some(sharded);
        }

        let attention_mask = if let Some(mask) = attention_mask {
            if row_index_mask.is_some() {
                return Err(LaminaError::InvalidEnvelope(
                    "attention_mask and row_index_mask can not be set at same time".into(),
                ));
            }
            let mut dense = prepare_decoder_attention_mask(Some(&mask), batch, seq)?;
            dense.set_requires_grad(false);
            if self.device.is_restricted() {
                dense = dense.to_bool()?;
            }
            Some(dense)
        } else if self.device.is_restricted() {
            // no mask supplied at all: full lower-triangular boolean mask
            let mut tril = tril_bool(seq);
            tril.set_requires_grad(false);
            Some(tril)
        } else if self.position_bias {
            // bias variant always observes a dense causal mask downstream
            let mut dense = prepare_decoder_attention_mask(None, batch, seq)?;
            dense.set_requires_grad(false);
            Some(dense)
        } else {
            None
        };

        Ok(EnvelopeSlots {
            hidden_states,
            attention_mask,
            row_index_mask,
            position_ids,
            bias,
        })
    }
}

/// Build the dense additive attention mask: causal structure combined with
/// the boolean padding mask, 0.0 where attention is allowed and -inf where
/// it is not. Returns [batch, 1, seq, seq].
pub fn prepare_decoder_attention_mask(
    padding_mask: Option<&Tensor>,
    batch: usize,
    seq: usize,
) -> Result<Tensor> {
    let padding: Option<Vec<bool>> = match padding_mask {
        Some(m) => {
            let b = m.to_bool()?;
            let slice = b
                .as_bool_slice()
                .ok_or(LaminaError::UnsupportedDType(m.dtype()))?
                .to_vec();
            if slice.len() != batch * seq {
                return Err(LaminaError::ShapeMismatch {
                    expected: vec![batch, seq],
                    got: m.shape().dims().to_vec(),
                });
            }
            Some(slice)
        }
        None => None,
    };

    let mut data = vec![f32::NEG_INFINITY; batch * seq * seq];
    for b in 0..batch {
        for i in 0..seq {
            for j in 0..=i {
                let visible = padding
                    .as_ref()
                    .map(|p| p[b * seq + j])
                    .unwrap_or(true);
                if visible {
                    data[(b * seq + i) * seq + j] = 0.0;
                }
            }
        }
    }
    Tensor::from_f32(&data, &[batch * seq * seq]).reshape(&[
        batch as isize,
        1,
        seq as isize,
        seq as isize,
    ])
}

/// Full lower-triangular boolean mask [seq, seq] for the restricted backend.
pub fn tril_bool(seq: usize) -> Tensor {
    let mut data = vec![false; seq * seq];
    for i in 0..seq {
        for j in 0..=i {
            data[i * seq + j] = true;
        }
    }
    Tensor::from_bool(&data, &[seq, seq])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;

    fn hidden() -> Tensor {
        Tensor::from_f32(&[0.0; 4], &[2, 2])
    }

    fn slots(
        am: Option<Tensor>,
        rim: Option<Tensor>,
        pid: Option<Tensor>,
        bias: Option<Tensor>,
    ) -> EnvelopeSlots {
        EnvelopeSlots {
            hidden_states: hidden(),
            attention_mask: am,
            row_index_mask: rim,
            position_ids: pid,
            bias,
        }
    }

    fn i32_t() -> Tensor {
        Tensor::from_i32(&[1, 2], &[1, 2])
    }

    fn i64_t() -> Tensor {
        Tensor::from_i64(&[1, 2], &[1, 2])
    }

    fn f32_t() -> Tensor {
        Tensor::from_f32(&[0.0, 0.0], &[1, 2])
    }

    fn resolver(bias: bool, device: Device) -> MaskResolver {
        MaskResolver::new(bias, device, Topology::single())
    }

    #[test]
    fn test_bias_variant_rule_1() {
        // row_index_mask populated, position_ids empty: that slot is the bias
        let r = resolver(true, Device::Cpu);
        let out = r.resolve(slots(Some(f32_t()), Some(f32_t()), None, None));
        assert!(out.bias.is_some());
        assert!(out.row_index_mask.is_none());
        assert!(out.position_ids.is_none());
        assert!(out.attention_mask.is_some());
    }

    #[test]
    fn test_bias_variant_rule_2() {
        // both populated: position_ids is the bias, row_index becomes position_ids
        let r = resolver(true, Device::Cpu);
        let rim = i64_t();
        let pid = f32_t();
        let out = r.resolve(slots(Some(f32_t()), Some(rim.clone()), Some(pid.clone()), None));
        assert!(out.bias.as_ref().unwrap().value_eq(&pid));
        assert!(out.position_ids.as_ref().unwrap().value_eq(&rim));
        assert!(out.row_index_mask.is_none());
    }

    #[test]
    fn test_bias_variant_noop_when_bias_present() {
        let r = resolver(true, Device::Cpu);
        let out = r.resolve(slots(Some(f32_t()), None, None, Some(f32_t())));
        assert!(out.bias.is_some());
        assert!(out.attention_mask.is_some());
    }

    #[test]
    fn test_accelerated_i32_mask_is_row_index() {
        let r = resolver(false, Device::Gpu(0));
        let am = i32_t();
        let rim = i64_t();
        let out = r.resolve(slots(Some(am.clone()), Some(rim.clone()), None, None));
        assert!(out.attention_mask.is_none());
        assert!(out.row_index_mask.as_ref().unwrap().value_eq(&am));
        assert!(out.position_ids.as_ref().unwrap().value_eq(&rim));
    }

    #[test]
    fn test_accelerated_i64_mask_is_position_ids() {
        let r = resolver(false, Device::Gpu(0));
        let am = i64_t();
        let out = r.resolve(slots(Some(am.clone()), Some(i32_t()), None, None));
        assert!(out.attention_mask.is_none());
        assert!(out.row_index_mask.is_none());
        assert!(out.position_ids.as_ref().unwrap().value_eq(&am));
    }

    #[test]
    fn test_accelerated_i64_row_index_is_position_ids() {
        let r = resolver(false, Device::Gpu(0));
        let rim = i64_t();
        let out = r.resolve(slots(None, Some(rim.clone()), None, None));
        assert!(out.row_index_mask.is_none());
        assert!(out.position_ids.as_ref().unwrap().value_eq(&rim));
    }

    #[test]
    fn test_accelerated_float_mask_untouched() {
        let r = resolver(false, Device::Gpu(0));
        let out = r.resolve(slots(Some(f32_t()), None, None, None));
        assert!(out.attention_mask.is_some());
        assert!(out.position_ids.is_none());
    }

    #[test]
    fn test_cpu_promotes_row_index_to_position_ids() {
        let r = resolver(false, Device::Cpu);
        let rim = i64_t();
        let out = r.resolve(slots(Some(f32_t()), Some(rim.clone()), None, None));
        assert!(out.row_index_mask.is_none());
        assert!(out.position_ids.as_ref().unwrap().value_eq(&rim));
    }

    #[test]
    fn test_cpu_keeps_existing_position_ids() {
        let r = resolver(false, Device::Cpu);
        let pid = i64_t();
        let out = r.resolve(slots(Some(f32_t()), Some(i32_t()), Some(pid.clone()), None));
        assert!(out.position_ids.as_ref().unwrap().value_eq(&pid));
        assert!(out.row_index_mask.is_some());
    }

    #[test]
    fn test_resolve_is_pure() {
        let r = resolver(false, Device::Gpu(0));
        let a = r.resolve(slots(Some(i32_t()), Some(i64_t()), None, None));
        let b = r.resolve(slots(Some(i32_t()), Some(i64_t()), None, None));
        assert_eq!(a.attention_mask.is_some(), b.attention_mask.is_some());
        assert_eq!(a.row_index_mask.is_some(), b.row_index_mask.is_some());
        assert_eq!(a.position_ids.is_some(), b.position_ids.is_some());
    }

    #[test]
    fn test_prepare_mask_causal_only() {
        let mask = prepare_decoder_attention_mask(None, 1, 3).unwrap();
        assert_eq!(mask.shape().dims(), &[1, 1, 3, 3]);
        let data = mask.as_f32_slice().unwrap();
        assert_eq!(data[0], 0.0); // (0,0)
        assert!(data[1].is_infinite()); // (0,1) future
        assert_eq!(data[3], 0.0); // (1,0)
        assert_eq!(data[8], 0.0); // (2,2)
    }

    #[test]
    fn test_prepare_mask_respects_padding() {
        let padding = Tensor::from_bool(&[false, true, true], &[1, 3]);
        let mask = prepare_decoder_attention_mask(Some(&padding), 1, 3).unwrap();
        let data = mask.as_f32_slice().unwrap();
        // column 0 is padding: masked in every row
        assert!(data[0].is_infinite());
        assert!(data[3].is_infinite());
        assert!(data[6].is_infinite());
        assert_eq!(data[4], 0.0); // (1,1)
    }

    #[test]
    fn test_entry_builds_dense_mask() {
        let r = resolver(false, Device::Gpu(0));
        let padding = Tensor::from_bool(&[true, true], &[1, 2]);
        let out = r
            .materialize_entry(slots(Some(padding), None, None, None), 1, 2, 2)
            .unwrap();
        let mask = out.attention_mask.unwrap();
        assert_eq!(mask.shape().dims(), &[1, 1, 2, 2]);
        assert!(!mask.requires_grad());
        assert!(out.bias.is_none());
    }

    #[test]
    fn test_entry_restricted_backend_gets_bool_tril() {
        let r = resolver(false, Device::Npu(0));
        let out = r
            .materialize_entry(slots(None, None, None, None), 1, 3, 2)
            .unwrap();
        let mask = out.attention_mask.unwrap();
        assert_eq!(mask.dtype(), DType::Bool);
        assert_eq!(mask.shape().dims(), &[3, 3]);
    }

    #[test]
    fn test_entry_restricted_backend_casts_prepared_mask() {
        let r = resolver(false, Device::Npu(0));
        let padding = Tensor::from_bool(&[true, true], &[1, 2]);
        let out = r
            .materialize_entry(slots(Some(padding), None, None, None), 1, 2, 2)
            .unwrap();
        assert_eq!(out.attention_mask.unwrap().dtype(), DType::Bool);
    }

    #[test]
    fn test_entry_bias_variant_builds_both() {
        let r = resolver(true, Device::Gpu(0));
        let out = r
            .materialize_entry(slots(None, None, None, None), 2, 3, 4)
            .unwrap();
        let bias = out.bias.unwrap();
        // (batch * heads, 1, seq)
        assert_eq!(bias.shape().dims(), &[8, 1, 3]);
        assert!(!bias.requires_grad());
        // fallback dense mask also materialized
        assert!(out.attention_mask.is_some());
    }

    #[test]
    fn test_entry_bias_discards_inbound_bias() {
        let r = resolver(true, Device::Cpu);
        let stale = Tensor::from_f32(&[9.9; 4], &[4, 1, 1]);
        let out = r
            .materialize_entry(slots(None, None, None, Some(stale.clone())), 1, 1, 4)
            .unwrap();
        assert!(!out.bias.unwrap().value_eq(&stale));
    }

    #[test]
    fn test_entry_exclusion_is_fatal() {
        let r = resolver(true, Device::Cpu);
        let out = r.materialize_entry(slots(None, Some(i32_t()), None, None), 1, 2, 2);
        assert!(out.is_err());

        let r = resolver(false, Device::Cpu);
        let out = r.materialize_entry(
            slots(Some(f32_t()), Some(i32_t()), None, None),
            1,
            2,
            2,
        );
        assert!(out.is_err());
    }
}
