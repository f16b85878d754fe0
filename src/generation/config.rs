//! Configuration for text generators
//!
//! Defines configuration structures for generator initialization
//! and sampling parameters for controlling generation behavior.

use anyhow::Result;
use candle_core::{DType, Device};
use candle_transformers::generation::Sampling;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::training::quant::parse_dtype;
use crate::training::DevicePreference;

/// Prompt used when none is given: complete a Python function from its docstring
pub const DEFAULT_PROMPT: &str = r#"def print_prime(n):
   """
   Print all primes between 1 and n
   """"#;

/// Configuration for initializing a generator model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// HuggingFace model ID or local path
    pub model_id: String,

    /// Optional adapter directory produced by fine-tuning
    pub adapter: Option<PathBuf>,

    /// Device preference (auto, cuda, metal, cpu)
    pub device: DevicePreference,

    /// Model data type ("auto", "f32", "f16", "bf16")
    ///
    /// `auto` follows `torch_dtype` from the model config on GPUs and
    /// uses f32 on CPU.
    pub dtype: String,

    /// Enable KV-cache for efficient generation
    pub use_kv_cache: bool,

    /// Upper bound on prompt plus generated tokens
    pub max_seq_length: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model_id: "microsoft/phi-2".to_string(),
            adapter: None,
            device: DevicePreference::Auto,
            dtype: "auto".to_string(),
            use_kv_cache: true,
            max_seq_length: 2048,
        }
    }
}

impl GeneratorConfig {
    /// Create a new generator config with the given model ID
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            ..Default::default()
        }
    }

    /// Set the adapter directory
    pub fn with_adapter(mut self, path: impl Into<PathBuf>) -> Self {
        self.adapter = Some(path.into());
        self
    }

    /// Set the device preference
    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    /// Set the data type
    pub fn with_dtype(mut self, dtype: &str) -> Self {
        self.dtype = dtype.to_string();
        self
    }

    /// Enable or disable KV-cache
    pub fn with_kv_cache(mut self, enable: bool) -> Self {
        self.use_kv_cache = enable;
        self
    }

    /// Resolve `dtype` against the checkpoint's `torch_dtype` and the device
    pub fn resolve_dtype(&self, torch_dtype: Option<&str>, device: &Device) -> Result<DType> {
        if !self.dtype.eq_ignore_ascii_case("auto") {
            return parse_dtype(&self.dtype);
        }
        if device.is_cpu() {
            return Ok(DType::F32);
        }
        match torch_dtype {
            Some(name) => parse_dtype(name),
            None => Ok(DType::F32),
        }
    }
}

/// Sampling parameters for text generation
///
/// Controls the randomness and diversity of generated text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Temperature (0 = greedy)
    pub temperature: f32,

    /// Top-p (nucleus sampling) - cumulative probability threshold
    pub top_p: f32,

    /// Top-k sampling (0 = disabled)
    pub top_k: usize,

    /// Repetition penalty (1.0 = no penalty)
    pub repetition_penalty: f32,

    /// Total length limit, prompt tokens included
    pub max_length: usize,

    /// Maximum new tokens to generate (takes precedence over `max_length`)
    pub max_new_tokens: Option<usize>,

    /// Stop sequences - generation stops when any of these are produced
    pub stop_sequences: Vec<String>,

    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self::greedy()
    }
}

impl SamplingParams {
    /// Greedy decoding, capped at 200 total tokens
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            max_length: 200,
            max_new_tokens: None,
            stop_sequences: vec![],
            seed: 42,
        }
    }

    /// Set temperature
    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    /// Set top-p
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set top-k
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set the total length limit
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set max new tokens
    pub fn with_max_new_tokens(mut self, max_tokens: usize) -> Self {
        self.max_new_tokens = Some(max_tokens);
        self
    }

    /// Add stop sequences
    pub fn with_stop_sequences(mut self, sequences: Vec<String>) -> Self {
        self.stop_sequences = sequences;
        self
    }

    /// Set random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of tokens to generate after a prompt of `prompt_len` tokens
    pub fn new_token_budget(&self, prompt_len: usize) -> usize {
        match self.max_new_tokens {
            Some(n) => n,
            None => self.max_length.saturating_sub(prompt_len),
        }
    }

    /// Candle sampling strategy for these parameters
    pub fn sampling(&self) -> Sampling {
        if self.temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        let temperature = self.temperature as f64;
        let top_p = (self.top_p > 0.0 && self.top_p < 1.0).then_some(self.top_p as f64);
        match (self.top_k, top_p) {
            (0, None) => Sampling::All { temperature },
            (0, Some(p)) => Sampling::TopP { p, temperature },
            (k, None) => Sampling::TopK { k, temperature },
            (k, Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_config_defaults() {
        let config = GeneratorConfig::default();

        assert_eq!(config.model_id, "microsoft/phi-2");
        assert!(config.adapter.is_none());
        assert_eq!(config.dtype, "auto");
        assert!(config.use_kv_cache);
    }

    #[test]
    fn test_generator_config_builder() {
        let config = GeneratorConfig::new("custom-model")
            .with_adapter("/path/to/adapter")
            .with_dtype("bf16")
            .with_device(DevicePreference::Cuda);

        assert_eq!(config.model_id, "custom-model");
        assert_eq!(config.adapter, Some(PathBuf::from("/path/to/adapter")));
        assert_eq!(config.device, DevicePreference::Cuda);
    }

    #[test]
    fn test_resolve_dtype() {
        let auto = GeneratorConfig::default();
        assert_eq!(auto.resolve_dtype(Some("float16"), &Device::Cpu).unwrap(), DType::F32);

        let explicit = GeneratorConfig::default().with_dtype("f16");
        assert_eq!(explicit.resolve_dtype(None, &Device::Cpu).unwrap(), DType::F16);

        let bad = GeneratorConfig::default().with_dtype("int3");
        assert!(bad.resolve_dtype(None, &Device::Cpu).is_err());
    }

    #[test]
    fn test_greedy_is_default() {
        let params = SamplingParams::default();
        assert_eq!(params.temperature, 0.0);
        assert_eq!(params.max_length, 200);
        assert!(matches!(params.sampling(), Sampling::ArgMax));
    }

    #[test]
    fn test_new_token_budget() {
        let params = SamplingParams::greedy();
        assert_eq!(params.new_token_budget(20), 180);
        assert_eq!(params.new_token_budget(250), 0);
        assert_eq!(params.with_max_new_tokens(5).new_token_budget(250), 5);
    }

    #[test]
    fn test_sampling_strategy() {
        let params = SamplingParams::greedy()
            .with_temperature(0.7)
            .with_top_p(0.9)
            .with_top_k(40);
        assert!(matches!(params.sampling(), Sampling::TopKThenTopP { k: 40, .. }));

        let params = params.with_top_k(0).with_top_p(1.0);
        assert!(matches!(params.sampling(), Sampling::All { .. }));
    }
}
