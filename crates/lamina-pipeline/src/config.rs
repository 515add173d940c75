//! Pipeline model configuration.

use serde::{Deserialize, Serialize};

use crate::recompute::RecomputeConfig;

/// Which loss object the last stage attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Token-level cross-entropy over the vocabulary.
    #[default]
    Pretraining,
    /// Preference-pair criterion (chosen/rejected log-probability margin).
    Preference,
}

/// Configuration for a pipeline-partitioned decoder model.
///
/// Fixed at construction time; nothing here mutates during training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Vocabulary size.
    pub vocab_size: usize,

    /// Hidden dimension (d_model).
    pub hidden_size: usize,

    /// Number of attention heads.
    pub num_attention_heads: usize,

    /// Number of repeated decoder layers (excluding embedding, final norm,
    /// and the head).
    pub num_layers: usize,

    /// RMS norm epsilon.
    pub norm_eps: f32,

    /// Whether positional information is injected as an additive attention
    /// bias instead of explicit position ids ("bias variant").
    pub position_bias: bool,

    /// Tie the input embedding and output projection to one shared weight.
    pub tie_word_embeddings: bool,

    /// Activation recomputation surface.
    #[serde(default)]
    pub recompute: RecomputeConfig,

    /// Loss selection for the last stage.
    #[serde(default)]
    pub loss: LossKind,
}

impl PipelineConfig {
    /// A tiny config for tests: small enough that a full forward pass over
    /// every stage runs in microseconds.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            hidden_size: 8,
            num_attention_heads: 2,
            num_layers: 4,
            norm_eps: 1e-5,
            position_bias: false,
            tie_word_embeddings: false,
            recompute: RecomputeConfig::default(),
            loss: LossKind::Pretraining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_round_trip() {
        let config = PipelineConfig::tiny();
        let json = serde_json::to_string(&config).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hidden_size, config.hidden_size);
        assert_eq!(back.loss, LossKind::Pretraining);
        assert!(!back.position_bias);
    }

    #[test]
    fn test_defaults_omitted_in_json() {
        let json = r#"{
            "vocab_size": 16, "hidden_size": 4, "num_attention_heads": 2,
            "num_layers": 2, "norm_eps": 1e-5,
            "position_bias": true, "tie_word_embeddings": true
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert!(config.position_bias);
        assert_eq!(config.loss, LossKind::Pretraining);
        assert!(config.recompute.excluded_layers.is_empty());
    }
}
