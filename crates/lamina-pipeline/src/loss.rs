//! Last-stage loss heads.
//!
//! The pipeline's last stage pairs the head's logits with the label fields
//! the batch splitter routed there. Which head applies is a model-level
//! choice, so it sits behind a trait selected from the config.

use lamina_core::{DType, LaminaError, Result, Tensor};

use crate::config::LossKind;

/// Ignored label positions (padding, prompt tokens).
pub const IGNORE_INDEX: i64 = -100;

/// A loss computed on the last pipeline stage.
pub trait LossFn: Send + Sync {
    /// `logits`: [rows, vocab], `labels`: [rows] integer indices.
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor>;
}

pub fn loss_for(kind: LossKind) -> Box<dyn LossFn> {
    match kind {
        LossKind::Pretraining => Box::new(PretrainingLoss),
        LossKind::Preference => Box::new(PreferenceLoss { beta: 0.1 }),
    }
}

fn check_pair(logits: &Tensor, labels: &Tensor) -> Result<(usize, usize)> {
    if logits.dtype() != DType::F32 {
        return Err(LaminaError::UnsupportedDType(logits.dtype()));
    }
    let dims = logits.shape().dims();
    let [rows, vocab] = dims else {
        return Err(LaminaError::ShapeMismatch {
            expected: vec![0, 0],
            got: dims.to_vec(),
        });
    };
    if labels.numel() != *rows {
        return Err(LaminaError::ShapeMismatch {
            expected: vec![*rows],
            got: labels.shape().dims().to_vec(),
        });
    }
    Ok((*rows, *vocab))
}

fn label_indices(labels: &Tensor) -> Result<Vec<i64>> {
    if let Some(s) = labels.as_i64_slice() {
        Ok(s.to_vec())
    } else if let Some(s) = labels.as_i32_slice() {
        Ok(s.iter().map(|&v| v as i64).collect())
    } else {
        Err(LaminaError::UnsupportedDType(labels.dtype()))
    }
}

/// Mean token cross-entropy over non-ignored positions.
pub struct PretrainingLoss;

impl LossFn for PretrainingLoss {
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (rows, vocab) = check_pair(logits, labels)?;
        let targets = label_indices(labels)?;

        let log_probs = logits.log_softmax_rows()?;
        let lp = log_probs
            .as_f32_slice()
            .ok_or(LaminaError::UnsupportedDType(log_probs.dtype()))?;

        let mut total = 0.0f32;
        let mut counted = 0usize;
        for r in 0..rows {
            let target = targets[r];
            if target == IGNORE_INDEX {
                continue;
            }
            let idx = target as usize;
            if target < 0 || idx >= vocab {
                return Err(LaminaError::Config(format!(
                    "label {target} out of range for vocab of {vocab}"
                )));
            }
            total -= lp[r * vocab + idx];
            counted += 1;
        }

        if counted == 0 {
            return Ok(Tensor::scalar(0.0));
        }
        Ok(Tensor::scalar(total / counted as f32))
    }
}

/// Pairwise preference loss over chosen/rejected completions.
///
/// Rows are paired by halves: the first `rows / 2` carry the chosen
/// completion, the rest the rejected one. Per pair the loss is
/// `-log_sigmoid(beta * (logp_chosen - logp_rejected))` with label log
/// probabilities summed over non-ignored positions.
pub struct PreferenceLoss {
    pub beta: f32,
}

impl PreferenceLoss {
    fn sequence_logp(lp: &[f32], targets: &[i64], vocab: usize, rows: std::ops::Range<usize>) -> f32 {
        let mut sum = 0.0f32;
        for r in rows {
            let target = targets[r];
            if target == IGNORE_INDEX {
                continue;
            }
            sum += lp[r * vocab + target as usize];
        }
        sum
    }
}

impl LossFn for PreferenceLoss {
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (rows, vocab) = check_pair(logits, labels)?;
        if rows % 2 != 0 {
            return Err(LaminaError::Config(format!(
                "preference loss needs an even row count, got {rows}"
            )));
        }
        let targets = label_indices(labels)?;
        for &t in &targets {
            if t != IGNORE_INDEX && (t < 0 || t as usize >= vocab) {
                return Err(LaminaError::Config(format!(
                    "label {t} out of range for vocab of {vocab}"
                )));
            }
        }

        let log_probs = logits.log_softmax_rows()?;
        let lp = log_probs
            .as_f32_slice()
            .ok_or(LaminaError::UnsupportedDType(log_probs.dtype()))?;

        let half = rows / 2;
        let chosen = Self::sequence_logp(lp, &targets, vocab, 0..half);
        let rejected = Self::sequence_logp(lp, &targets, vocab, half..rows);

        let margin = self.beta * (chosen - rejected);
        // -log(sigmoid(x)) = softplus(-x), computed in its stable form
        let loss = (-margin).max(0.0) + (1.0 + (-margin.abs()).exp()).ln();
        Ok(Tensor::scalar(loss))
    }
}
