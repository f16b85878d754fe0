//! Common traits and utilities for causal language models

use anyhow::{Context, Result};
use candle_core::{Device, Tensor, Var};
use serde::Deserialize;
use std::path::Path;

use crate::training::lora::LoraStats;

/// A causal language model that can be trained
pub trait CausalLanguageModel {
    /// Full-sequence logits `[batch, seq_len, vocab]` without KV cache
    fn forward_train(&self, input_ids: &Tensor, train: bool) -> Result<Tensor>;
    fn vocab_size(&self) -> usize;
    fn device(&self) -> &Device;
}

/// Trait for models that carry LoRA adapters
pub trait LoraModel: CausalLanguageModel {
    fn lora_stats(&self) -> LoraStats;
    fn trainable_vars(&self) -> Vec<Var>;

    // Use &Path instead of impl AsRef<Path> for object safety
    fn save_adapter(&self, dir: &Path) -> Result<()>;
    fn load_adapter(&mut self, dir: &Path) -> Result<()>;
}

/// Model architecture types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    Llama,
    Mistral,
    Qwen2,
    Phi,
}

impl std::fmt::Display for ModelArchitecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llama => write!(f, "llama"),
            Self::Mistral => write!(f, "mistral"),
            Self::Qwen2 => write!(f, "qwen2"),
            Self::Phi => write!(f, "phi"),
        }
    }
}

impl ModelArchitecture {
    /// Whether the LoRA decoder can load this weight layout
    pub fn supports_lora(&self) -> bool {
        matches!(self, Self::Llama | Self::Mistral | Self::Qwen2)
    }

    /// Whether q/k/v projections carry a bias
    pub fn has_attention_bias(&self) -> bool {
        matches!(self, Self::Qwen2)
    }
}

/// Detect model architecture from config
pub fn detect_architecture(
    model_type: Option<&str>,
    architectures: &[String],
) -> Result<ModelArchitecture> {
    let candidates = model_type
        .into_iter()
        .map(str::to_string)
        .chain(architectures.iter().cloned());

    for name in candidates {
        let name = name.to_lowercase();
        if name.contains("qwen") {
            return Ok(ModelArchitecture::Qwen2);
        }
        if name.contains("llama") {
            return Ok(ModelArchitecture::Llama);
        }
        if name.contains("mistral") {
            return Ok(ModelArchitecture::Mistral);
        }
        if name.contains("phi") {
            return Ok(ModelArchitecture::Phi);
        }
    }

    anyhow::bail!(
        "Could not detect model architecture from type={:?}, architectures={:?}",
        model_type,
        architectures
    )
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

/// Decoder hyperparameters read from `config.json`
#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub torch_dtype: Option<String>,
}

impl DecoderConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config: {:?}", path))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse model config: {:?}", path))?;

        if config.architecture()?.has_attention_bias() {
            config.attention_bias = true;
        }
        Ok(config)
    }

    pub fn architecture(&self) -> Result<ModelArchitecture> {
        detect_architecture(self.model_type.as_deref(), &self.architectures)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            anyhow::bail!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size,
                self.num_attention_heads
            );
        }
        if self.num_kv_heads() == 0 || self.num_attention_heads % self.num_kv_heads() != 0 {
            anyhow::bail!(
                "num_attention_heads {} is not divisible by num_key_value_heads {}",
                self.num_attention_heads,
                self.num_kv_heads()
            );
        }
        Ok(())
    }
}
