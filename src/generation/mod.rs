//! Generator module for text generation
//!
//! Provides trait-based abstraction for decoder LLMs with Candle implementations.
//! One prompt at a time; no batching or streaming.

pub mod candle;
pub mod config;

pub use candle::CandleGenerator;
pub use config::{GeneratorConfig, SamplingParams, DEFAULT_PROMPT};

use anyhow::Result;

/// Trait for text generation models
pub trait Generator: Send + Sync {
    /// Generate a completion for `prompt`
    ///
    /// Returns only the generated text, special tokens removed.
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String>;

    /// Generate and decode prompt plus completion together
    ///
    /// Special tokens are kept, so an emitted EOS shows up in the text.
    fn generate_full(&self, prompt: &str, params: &SamplingParams) -> Result<String>;

    /// Get the model name/identifier
    fn model_name(&self) -> &str;

    /// Count tokens in text
    fn count_tokens(&self, text: &str) -> Result<usize>;
}

/// Factory function for creating generators
pub fn create_generator(config: GeneratorConfig) -> Result<Box<dyn Generator>> {
    Ok(Box::new(CandleGenerator::new(config)?))
}
