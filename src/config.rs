//! Model and query-round configuration

use std::path::{Path, PathBuf};

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Architecture of the encoder-decoder translation model (`config.json` in a checkpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Source vocabulary size
    pub src_vocab_size: usize,

    /// Target vocabulary size
    pub tgt_vocab_size: usize,

    /// Model dimension
    pub hidden_size: usize,

    /// Number of encoder layers
    pub num_encoder_layers: usize,

    /// Number of decoder layers
    pub num_decoder_layers: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of key-value heads (GQA); equal to `num_attention_heads` for plain MHA
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    /// Feed-forward inner size
    pub intermediate_size: usize,

    /// Longest sequence the rotary tables cover
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// RoPE theta
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// RMSNorm epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    /// Share the target embedding matrix with the generator projection
    #[serde(default)]
    pub tie_word_embeddings: bool,

    /// Parameter dtype: "float32", "float16" or "bfloat16"
    #[serde(default = "default_dtype")]
    pub dtype: String,
}

fn default_max_position_embeddings() -> usize {
    1024
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_dtype() -> String {
    "float32".to_string()
}

impl ModelConfig {
    /// Load configuration from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Query heads per KV head
    pub fn num_kv_groups(&self) -> usize {
        self.num_attention_heads / self.num_kv_heads()
    }

    pub fn candle_dtype(&self) -> DType {
        match self.dtype.to_lowercase().as_str() {
            "float16" | "f16" | "half" => DType::F16,
            "bfloat16" | "bf16" => DType::BF16,
            _ => DType::F32,
        }
    }

    /// Small config for tests and smoke runs
    pub fn tiny(src_vocab_size: usize, tgt_vocab_size: usize) -> Self {
        Self {
            src_vocab_size,
            tgt_vocab_size,
            hidden_size: 16,
            num_encoder_layers: 1,
            num_decoder_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            intermediate_size: 32,
            max_position_embeddings: 64,
            rope_theta: default_rope_theta(),
            rms_norm_eps: default_rms_norm_eps(),
            tie_word_embeddings: false,
            dtype: default_dtype(),
        }
    }
}

/// Knobs for one active-learning query round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Checkpoint directory, required by model-based strategies
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,

    /// Maximum generated length including BOS
    #[serde(default = "default_max_len")]
    pub max_len: usize,

    /// Largest sub-batch handed to the decoder in one loop
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Fixed inference batch size
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Cap on sentences per batch when batching by tokens
    #[serde(default)]
    pub dataset_max_batch_size: Option<usize>,

    /// Batch by total tokens instead of sentence count
    #[serde(default)]
    pub tokens_per_batch: Option<usize>,

    /// Force CPU even when an accelerator is available
    #[serde(default)]
    pub no_cuda: bool,

    /// Seed for the random strategy and iterator shuffling
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_len() -> usize {
    250
}

fn default_max_batch_size() -> usize {
    800
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            checkpoint: None,
            max_len: default_max_len(),
            max_batch_size: default_max_batch_size(),
            batch_size: None,
            dataset_max_batch_size: None,
            tokens_per_batch: None,
            no_cuda: false,
            seed: None,
        }
    }
}

impl QueryConfig {
    /// Load from a JSON file; absent fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_len < 2 {
            return Err(Error::Config(format!(
                "max_len must be at least 2, got {}",
                self.max_len
            )));
        }
        if self.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be positive".into()));
        }
        if self.batch_size == Some(0) || self.tokens_per_batch == Some(0) {
            return Err(Error::Config("batch sizes must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_defaults_from_empty_json() {
        let config: QueryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_len, 250);
        assert_eq!(config.max_batch_size, 800);
        assert!(config.checkpoint.is_none());
        assert!(!config.no_cuda);
        config.validate().unwrap();
    }

    #[test]
    fn test_max_len_lower_bound() {
        let config = QueryConfig {
            max_len: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_model_config_parse() {
        let json = r#"{
            "src_vocab_size": 100,
            "tgt_vocab_size": 120,
            "hidden_size": 64,
            "num_encoder_layers": 2,
            "num_decoder_layers": 3,
            "num_attention_heads": 8,
            "num_key_value_heads": 2,
            "intermediate_size": 256
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.head_dim(), 8);
        assert_eq!(config.num_kv_groups(), 4);
        assert_eq!(config.candle_dtype(), DType::F32);
        assert_eq!(config.max_position_embeddings, 1024);
    }
}
