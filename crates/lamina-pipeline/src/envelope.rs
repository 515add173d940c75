//! Inter-stage argument envelope: the bundle of tensors one pipeline stage
//! hands to the next.
//!
//! The wire form is purely positional: an ordered tuple of 1 to 5 tensors
//! whose arity is the only signal the receiver has for which slots are
//! present. The fixed slot order is
//! `(hidden_states, attention_mask, row_index_mask, position_ids, bias)`.
//!
//! In memory the envelope is the named [`EnvelopeSlots`] struct, so call
//! sites construct slots by name and only the stage boundary deals in
//! positions. Decoding reproduces the historical arity table exactly; the
//! positional scheme can conflate slots (a 2-tuple carrying position ids
//! decodes as an attention mask), which is what [`crate::resolver`] exists
//! to untangle.

use lamina_core::{LaminaError, Result, Tensor};

/// Fully named slot assignment for one stage boundary.
///
/// `hidden_states` is always present; every other slot is optional and
/// mutually independent at this level. Exclusion rules between slots are
/// enforced after mask resolution, where the original semantics checked
/// them.
#[derive(Debug, Clone)]
pub struct EnvelopeSlots {
    pub hidden_states: Tensor,
    pub attention_mask: Option<Tensor>,
    pub row_index_mask: Option<Tensor>,
    pub position_ids: Option<Tensor>,
    pub bias: Option<Tensor>,
}

impl EnvelopeSlots {
    /// An envelope carrying only activations.
    pub fn bare(hidden_states: Tensor) -> Self {
        Self {
            hidden_states,
            attention_mask: None,
            row_index_mask: None,
            position_ids: None,
            bias: None,
        }
    }

    /// Error if mutually-exclusive slots are populated together.
    ///
    /// `attention_mask`/`row_index_mask` and `bias`/`row_index_mask` cannot
    /// coexist; either pair indicates a caller or configuration bug.
    pub fn check_exclusion(&self) -> Result<()> {
        if self.attention_mask.is_some() && self.row_index_mask.is_some() {
            return Err(LaminaError::InvalidEnvelope(
                "attention_mask and row_index_mask can not be set at same time".into(),
            ));
        }
        if self.bias.is_some() && self.row_index_mask.is_some() {
            return Err(LaminaError::InvalidEnvelope(
                "bias and row_index_mask can not be set at same time".into(),
            ));
        }
        Ok(())
    }
}

/// Wire form of the envelope: a bare activation tensor or a positional
/// tuple of 2–5 tensors.
#[derive(Debug, Clone)]
pub enum Envelope {
    /// Arity 1: the envelope degenerates to the activation tensor itself.
    Bare(Tensor),
    /// Arity 2–5: hidden states followed by the populated auxiliary slots
    /// in slot order.
    Bundle(Vec<Tensor>),
}

impl Envelope {
    /// Number of materialized slots.
    pub fn arity(&self) -> usize {
        match self {
            Envelope::Bare(_) => 1,
            Envelope::Bundle(ts) => ts.len(),
        }
    }

    /// Pack named slots into the positional wire form.
    ///
    /// Auxiliary tensors are deep-cloned before forwarding so an in-place
    /// mutation by a later stage cannot touch a buffer an earlier stage
    /// still holds for its backward pass. Empty slots are dropped; the
    /// remaining tensors are appended in slot order.
    pub fn encode(slots: &EnvelopeSlots) -> Envelope {
        let mut out = vec![slots.hidden_states.clone()];
        for aux in [
            &slots.attention_mask,
            &slots.row_index_mask,
            &slots.position_ids,
            &slots.bias,
        ]
        .into_iter()
        .flatten()
        {
            out.push(aux.deep_clone());
        }
        if out.len() == 1 {
            Envelope::Bare(out.pop().expect("one element"))
        } else {
            Envelope::Bundle(out)
        }
    }

    /// Unpack the positional wire form into named slots.
    ///
    /// The arity-to-slot table is fixed:
    ///
    /// | arity | slots populated                                            |
    /// |-------|------------------------------------------------------------|
    /// | 1     | hidden_states                                              |
    /// | 2     | + attention_mask                                           |
    /// | 3     | + row_index_mask                                           |
    /// | 4     | + position_ids                                             |
    /// | 5     | + bias                                                     |
    ///
    /// Every auxiliary slot is detached on arrival — no gradient flows
    /// through masks, position ids, or the bias.
    pub fn decode(&self) -> Result<EnvelopeSlots> {
        let tensors: Vec<&Tensor> = match self {
            Envelope::Bare(t) => vec![t],
            Envelope::Bundle(ts) => ts.iter().collect(),
        };

        if tensors.is_empty() || tensors.len() > 5 {
            return Err(LaminaError::InvalidEnvelope(format!(
                "envelope arity must be 1..=5, got {}",
                tensors.len()
            )));
        }

        let aux = |i: usize| tensors.get(i).map(|t| t.detach());
        Ok(EnvelopeSlots {
            hidden_states: tensors[0].clone(),
            attention_mask: aux(1),
            row_index_mask: aux(2),
            position_ids: aux(3),
            bias: aux(4),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lamina_core::DType;

    fn hidden() -> Tensor {
        Tensor::from_f32(&[0.1, 0.2, 0.3, 0.4], &[2, 2])
    }

    fn aux_i64(v: i64) -> Tensor {
        Tensor::from_i64(&[v, v + 1], &[1, 2])
    }

    #[test]
    fn test_arity_1_is_bare() {
        let env = Envelope::encode(&EnvelopeSlots::bare(hidden()));
        assert!(matches!(env, Envelope::Bare(_)));
        assert_eq!(env.arity(), 1);
        let slots = env.decode().unwrap();
        assert!(slots.attention_mask.is_none());
        assert!(slots.bias.is_none());
    }

    #[test]
    fn test_arity_table() {
        let mut slots = EnvelopeSlots::bare(hidden());
        slots.attention_mask = Some(Tensor::from_f32(&[0.0, 0.0], &[1, 2]));
        assert_eq!(Envelope::encode(&slots).arity(), 2);

        slots.row_index_mask = Some(Tensor::from_i32(&[2, 2], &[1, 2]));
        assert_eq!(Envelope::encode(&slots).arity(), 3);

        slots.position_ids = Some(aux_i64(0));
        assert_eq!(Envelope::encode(&slots).arity(), 4);

        slots.bias = Some(Tensor::from_f32(&[-0.5, -0.5], &[1, 2]));
        let env = Envelope::encode(&slots);
        assert_eq!(env.arity(), 5);

        let decoded = env.decode().unwrap();
        assert_eq!(decoded.attention_mask.unwrap().dtype(), DType::F32);
        assert_eq!(decoded.row_index_mask.unwrap().dtype(), DType::I32);
        assert_eq!(decoded.position_ids.unwrap().dtype(), DType::I64);
        assert_eq!(decoded.bias.unwrap().dtype(), DType::F32);
    }

    #[test]
    fn test_round_trip_values() {
        let mut slots = EnvelopeSlots::bare(hidden());
        slots.attention_mask = Some(Tensor::from_f32(&[0.0, f32::NEG_INFINITY], &[1, 2]));
        slots.row_index_mask = Some(Tensor::from_i32(&[3, 4], &[1, 2]));
        let decoded = Envelope::encode(&slots).decode().unwrap();
        assert!(decoded.hidden_states.value_eq(&slots.hidden_states));
        assert!(decoded
            .attention_mask
            .unwrap()
            .value_eq(slots.attention_mask.as_ref().unwrap()));
        assert!(decoded
            .row_index_mask
            .unwrap()
            .value_eq(slots.row_index_mask.as_ref().unwrap()));
    }

    #[test]
    fn test_positional_conflation_is_preserved() {
        // A gap before position_ids shifts it into the attention_mask slot.
        // This matches the historical wire format; the resolver untangles it.
        let mut slots = EnvelopeSlots::bare(hidden());
        slots.position_ids = Some(aux_i64(5));
        let env = Envelope::encode(&slots);
        assert_eq!(env.arity(), 2);
        let decoded = env.decode().unwrap();
        assert!(decoded.position_ids.is_none());
        assert_eq!(decoded.attention_mask.unwrap().dtype(), DType::I64);
    }

    #[test]
    fn test_aux_detached_on_decode() {
        let mut mask = Tensor::from_f32(&[0.0, 0.0], &[1, 2]);
        mask.set_requires_grad(true);
        let mut slots = EnvelopeSlots::bare(hidden());
        slots.attention_mask = Some(mask);
        let decoded = Envelope::encode(&slots).decode().unwrap();
        assert!(!decoded.attention_mask.unwrap().requires_grad());
    }

    #[test]
    fn test_encode_clones_aux() {
        let mask = Tensor::from_f32(&[0.0, 0.0], &[1, 2]);
        let mut slots = EnvelopeSlots::bare(hidden());
        slots.attention_mask = Some(mask.clone());
        let env = Envelope::encode(&slots);
        let Envelope::Bundle(ts) = env else {
            panic!("expected bundle")
        };
        // hidden states may be forwarded as-is, aux slots must not alias
        assert!(ts[0].shares_storage(&slots.hidden_states));
        assert!(!ts[1].shares_storage(&mask));
    }

    #[test]
    fn test_exclusion_checks() {
        let mut slots = EnvelopeSlots::bare(hidden());
        slots.attention_mask = Some(Tensor::from_f32(&[0.0, 0.0], &[1, 2]));
        slots.row_index_mask = Some(Tensor::from_i32(&[1, 1], &[1, 2]));
        assert!(slots.check_exclusion().is_err());

        slots.attention_mask = None;
        slots.bias = Some(Tensor::from_f32(&[0.0, 0.0], &[1, 2]));
        assert!(slots.check_exclusion().is_err());

        slots.row_index_mask = None;
        assert!(slots.check_exclusion().is_ok());
    }

    #[test]
    fn test_oversized_bundle_rejected() {
        let ts = vec![hidden(); 6];
        assert!(Envelope::Bundle(ts).decode().is_err());
        assert!(Envelope::Bundle(vec![]).decode().is_err());
    }
}
