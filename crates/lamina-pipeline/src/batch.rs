//! Splitting a raw training example into first-stage inputs and last-stage
//! labels.
//!
//! Only the first stage sees the raw input fields and only the last stage
//! sees the labels; everything in between exchanges envelopes. The splitter
//! accepts either one mapping of field name to tensor or a sequence of such
//! mappings; the sequence case is transposed into parallel per-field
//! sequences before extraction.

use std::collections::HashMap;

use lamina_core::{LaminaError, Result, Tensor};

/// Fields the first stage consumes, in slot order.
pub const FIRST_STAGE_FIELDS: [&str; 4] = [
    "input_ids",
    "attention_mask",
    "row_index_mask",
    "position_ids",
];

/// Fields the last stage consumes.
pub const LAST_STAGE_FIELDS: [&str; 1] = ["labels"];

/// An extracted field: one tensor, or one tensor per example after
/// transposition.
#[derive(Debug, Clone)]
pub enum FieldValue {
    One(Tensor),
    Many(Vec<Tensor>),
}

impl FieldValue {
    pub fn as_one(&self) -> Option<&Tensor> {
        match self {
            FieldValue::One(t) => Some(t),
            FieldValue::Many(_) => None,
        }
    }

    pub fn as_many(&self) -> Option<&[Tensor]> {
        match self {
            FieldValue::Many(ts) => Some(ts),
            FieldValue::One(_) => None,
        }
    }
}

/// The values extracted for one stage's field group.
///
/// A group that enumerates exactly one field name is unwrapped to the bare
/// value instead of a one-element tuple.
#[derive(Debug, Clone)]
pub enum StageGroup {
    Tuple(Vec<Option<FieldValue>>),
    Single(Option<FieldValue>),
}

impl StageGroup {
    /// Positional access; `Single` behaves as a one-element tuple.
    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        match self {
            StageGroup::Tuple(vs) => vs.get(index).and_then(|v| v.as_ref()),
            StageGroup::Single(v) if index == 0 => v.as_ref(),
            StageGroup::Single(_) => None,
        }
    }
}

/// Raw input to the splitter.
pub enum RawBatch {
    /// One mapping of field name to tensor.
    Single(HashMap<String, Tensor>),
    /// A sequence of examples, transposed before extraction.
    Sequence(Vec<HashMap<String, Tensor>>),
}

/// Splits raw examples into the per-stage field groups.
pub struct BatchSplitter;

impl BatchSplitter {
    /// Extract `(first_stage_inputs, last_stage_labels)`.
    ///
    /// Missing fields are absent, not errors. In the sequence case the keys
    /// of the first example define the schema; a later example missing one
    /// of those keys is a caller bug and fails eagerly.
    pub fn split(batch: RawBatch) -> Result<(StageGroup, StageGroup)> {
        match batch {
            RawBatch::Single(mut fields) => Ok((
                extract_single(&mut fields, &FIRST_STAGE_FIELDS),
                extract_single(&mut fields, &LAST_STAGE_FIELDS),
            )),
            RawBatch::Sequence(examples) => {
                let mut transposed = transpose(examples)?;
                Ok((
                    extract_many(&mut transposed, &FIRST_STAGE_FIELDS),
                    extract_many(&mut transposed, &LAST_STAGE_FIELDS),
                ))
            }
        }
    }
}

/// Transpose a sequence of mappings into parallel per-field sequences.
fn transpose(examples: Vec<HashMap<String, Tensor>>) -> Result<HashMap<String, Vec<Tensor>>> {
    let mut out: HashMap<String, Vec<Tensor>> = HashMap::new();
    let keys: Vec<String> = match examples.first() {
        Some(first) => first.keys().cloned().collect(),
        None => return Ok(out),
    };

    let count = examples.len();
    let mut examples = examples;
    for key in keys {
        let mut column = Vec::with_capacity(count);
        for (i, example) in examples.iter_mut().enumerate() {
            let value = example.remove(&key).ok_or_else(|| {
                LaminaError::Config(format!("example {i} is missing field '{key}'"))
            })?;
            column.push(value);
        }
        out.insert(key, column);
    }
    Ok(out)
}

fn extract_single(fields: &mut HashMap<String, Tensor>, names: &[&str]) -> StageGroup {
    let values: Vec<Option<FieldValue>> = names
        .iter()
        .map(|&name| fields.remove(name).map(FieldValue::One))
        .collect();
    wrap(values)
}

fn extract_many(fields: &mut HashMap<String, Vec<Tensor>>, names: &[&str]) -> StageGroup {
    let values: Vec<Option<FieldValue>> = names
        .iter()
        .map(|&name| fields.remove(name).map(FieldValue::Many))
        .collect();
    wrap(values)
}

fn wrap(mut values: Vec<Option<FieldValue>>) -> StageGroup {
    if values.len() == 1 {
        StageGroup::Single(values.pop().expect("one element"))
    } else {
        StageGroup::Tuple(values)
    }
}

/// Sequence-pooling method for embedding-style heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pooling {
    Mean,
    Cls,
    Last,
}

impl Pooling {
    /// Parse a configured pooling method, naming the invalid value on
    /// failure.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "mean" => Ok(Pooling::Mean),
            "cls" => Ok(Pooling::Cls),
            "last" => Ok(Pooling::Last),
            other => Err(LaminaError::UnsupportedPooling(other.to_string())),
        }
    }
}

/// Which side sequences were padded on; `last` pooling must know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingSide {
    Left,
    Right,
}

impl PaddingSide {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "left" => Ok(PaddingSide::Left),
            "right" => Ok(PaddingSide::Right),
            other => Err(LaminaError::UnsupportedPaddingSide(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[i64]) -> Tensor {
        Tensor::from_i64(values, &[values.len()])
    }

    #[test]
    fn test_single_mapping_split() {
        let mut fields = HashMap::new();
        fields.insert("input_ids".to_string(), ids(&[1, 2, 3]));
        fields.insert("attention_mask".to_string(), ids(&[1, 1, 1]));
        fields.insert("labels".to_string(), ids(&[4]));

        let (first, last) = BatchSplitter::split(RawBatch::Single(fields)).unwrap();

        let StageGroup::Tuple(values) = &first else {
            panic!("first stage group must stay a tuple")
        };
        assert_eq!(values.len(), 4);
        assert!(values[0].as_ref().unwrap().as_one().unwrap().value_eq(&ids(&[1, 2, 3])));
        assert!(values[1].as_ref().unwrap().as_one().unwrap().value_eq(&ids(&[1, 1, 1])));
        assert!(values[2].is_none());
        assert!(values[3].is_none());

        // exactly one label field: unwrapped, not a one-element tuple
        let StageGroup::Single(label) = last else {
            panic!("last stage group must unwrap")
        };
        assert!(label.unwrap().as_one().unwrap().value_eq(&ids(&[4])));
    }

    #[test]
    fn test_missing_fields_are_absent_not_errors() {
        let mut fields = HashMap::new();
        fields.insert("input_ids".to_string(), ids(&[9]));
        let (first, last) = BatchSplitter::split(RawBatch::Single(fields)).unwrap();
        assert!(first.get(0).is_some());
        assert!(first.get(1).is_none());
        let StageGroup::Single(label) = last else {
            panic!()
        };
        assert!(label.is_none());
    }

    #[test]
    fn test_sequence_transposes_before_extraction() {
        let example = |x: i64, y: i64| {
            let mut m = HashMap::new();
            m.insert("input_ids".to_string(), ids(&[x]));
            m.insert("labels".to_string(), ids(&[y]));
            m
        };
        let (first, last) =
            BatchSplitter::split(RawBatch::Sequence(vec![example(1, 10), example(2, 20)]))
                .unwrap();

        // one tuple holding two-element sequences, not two tuples
        let col = first.get(0).unwrap().as_many().unwrap();
        assert_eq!(col.len(), 2);
        assert!(col[0].value_eq(&ids(&[1])));
        assert!(col[1].value_eq(&ids(&[2])));

        let StageGroup::Single(Some(labels)) = last else {
            panic!()
        };
        assert_eq!(labels.as_many().unwrap().len(), 2);
    }

    #[test]
    fn test_ragged_sequence_is_fatal() {
        let mut a = HashMap::new();
        a.insert("input_ids".to_string(), ids(&[1]));
        let b = HashMap::new();
        assert!(BatchSplitter::split(RawBatch::Sequence(vec![a, b])).is_err());
    }

    #[test]
    fn test_empty_sequence() {
        let (first, last) = BatchSplitter::split(RawBatch::Sequence(vec![])).unwrap();
        assert!(first.get(0).is_none());
        let StageGroup::Single(v) = last else { panic!() };
        assert!(v.is_none());
    }

    #[test]
    fn test_pooling_validation() {
        assert_eq!(Pooling::parse("mean").unwrap(), Pooling::Mean);
        assert_eq!(Pooling::parse("last").unwrap(), Pooling::Last);
        let err = Pooling::parse("max").unwrap_err();
        assert!(err.to_string().contains("max"));
    }

    #[test]
    fn test_padding_side_validation() {
        assert_eq!(PaddingSide::parse("left").unwrap(), PaddingSide::Left);
        let err = PaddingSide::parse("top").unwrap_err();
        assert!(err.to_string().contains("top"));
    }
}
