//! Tokenizer wrapper for HuggingFace tokenizers
//!
//! Provides a convenient interface for tokenizing text for causal language
//! models. Padding reuses the EOS token and pads on the right, which is what
//! the fine-tuning loop and the loss mask expect.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use std::path::Path;
use tokenizers::{
    PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams,
};

use crate::training::hub::ModelPath;

/// Token strings tried when the tokenizer config names no EOS token
const EOS_FALLBACKS: [&str; 3] = ["</s>", "<|endoftext|>", "<eos>"];

/// Wrapper around HuggingFace tokenizer
#[derive(Clone)]
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
    max_length: usize,
    eos_token: Option<String>,
    pad_token_id: Option<u32>,
}

impl TokenizerWrapper {
    /// Wrap an already constructed tokenizer
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self {
            tokenizer,
            max_length: 512,
            eos_token: None,
            pad_token_id: None,
        }
    }

    /// Load tokenizer from a file path
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        Ok(Self::new(tokenizer))
    }

    /// Load tokenizer from a ModelPath
    ///
    /// Reads `tokenizer_config.json` next to it for the EOS token name.
    pub fn from_model_path(model_path: &ModelPath) -> Result<Self> {
        let tokenizer_path = model_path
            .tokenizer_file
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Tokenizer file not found in model path"))?;

        let mut wrapper = Self::from_file(tokenizer_path)?;
        if let Some(config_path) = &model_path.tokenizer_config_file {
            wrapper.eos_token = read_eos_token(config_path)?;
        }
        Ok(wrapper)
    }

    /// Set maximum sequence length
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set the EOS token string explicitly
    pub fn with_eos_token(mut self, token: impl Into<String>) -> Self {
        self.eos_token = Some(token.into());
        self
    }

    /// Use the EOS token as padding token, padding on the right
    pub fn with_pad_token_from_eos(mut self) -> Result<Self> {
        let eos_id = self.eos_token_id()?;
        let eos_token = self
            .tokenizer
            .id_to_token(eos_id)
            .ok_or_else(|| anyhow::anyhow!("EOS id {} has no token string", eos_id))?;

        self.tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            direction: PaddingDirection::Right,
            pad_id: eos_id,
            pad_token: eos_token,
            ..Default::default()
        }));
        self.pad_token_id = Some(eos_id);
        Ok(self)
    }

    /// Get the maximum sequence length
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Id of the end-of-sequence token
    pub fn eos_token_id(&self) -> Result<u32> {
        if let Some(token) = &self.eos_token {
            return self
                .tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow::anyhow!("EOS token '{}' is not in the vocabulary", token));
        }

        EOS_FALLBACKS
            .iter()
            .find_map(|t| self.tokenizer.token_to_id(t))
            .ok_or_else(|| anyhow::anyhow!("Tokenizer defines no EOS token"))
    }

    /// Padding token id, once configured
    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    /// Encode a single text
    ///
    /// # Arguments
    /// * `text` - Text to encode
    /// * `add_special_tokens` - Whether to add BOS/EOS as the tokenizer defines them
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<EncodedInput> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;

        Ok(EncodedInput {
            input_ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        })
    }

    /// Encode a batch of texts, padded to the longest and truncated to `max_length`
    pub fn encode_batch(&self, texts: &[String], add_special_tokens: bool) -> Result<BatchEncodedInput> {
        let mut tokenizer = self.tokenizer.clone();
        if tokenizer.get_padding().is_none() {
            tokenizer.with_padding(Some(PaddingParams {
                strategy: PaddingStrategy::BatchLongest,
                ..Default::default()
            }));
        }

        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: self.max_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Failed to set truncation: {}", e))?;

        let encodings = tokenizer
            .encode_batch(texts.to_vec(), add_special_tokens)
            .map_err(|e| anyhow::anyhow!("Batch tokenization failed: {}", e))?;

        let batch_size = encodings.len();
        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);

        for encoding in &encodings {
            input_ids.extend(encoding.get_ids());
            attention_mask.extend(encoding.get_attention_mask());
        }

        Ok(BatchEncodedInput {
            input_ids,
            attention_mask,
            batch_size,
            seq_len,
        })
    }

    /// Token count of each text, without padding or truncation
    pub fn token_lengths(&self, texts: &[String]) -> Result<Vec<usize>> {
        texts
            .iter()
            .map(|t| Ok(self.encode(t, true)?.len().min(self.max_length)))
            .collect()
    }

    /// Decode token IDs back to text
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("Decoding failed: {}", e))
    }

    /// Get vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Access the underlying tokenizer
    pub fn inner(&self) -> &Tokenizer {
        &self.tokenizer
    }
}

/// Read `eos_token` from a `tokenizer_config.json`
///
/// The field is either a plain string or an object with a `content` key.
fn read_eos_token(path: &Path) -> Result<Option<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tokenizer config: {:?}", path))?;
    let config: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse tokenizer config: {:?}", path))?;

    Ok(match config.get("eos_token") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Object(obj)) => obj
            .get("content")
            .and_then(|c| c.as_str())
            .map(str::to_string),
        _ => None,
    })
}

/// Encoded input for a single text
#[derive(Debug, Clone)]
pub struct EncodedInput {
    /// Token IDs
    pub input_ids: Vec<u32>,
    /// Attention mask (1 for real tokens, 0 for padding)
    pub attention_mask: Vec<u32>,
}

impl EncodedInput {
    /// Get sequence length
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Convert to tensors
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let input_ids = Tensor::new(&self.input_ids[..], device)?.unsqueeze(0)?;

        let attention_mask = Tensor::new(&self.attention_mask[..], device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?;

        Ok((input_ids, attention_mask))
    }
}

/// Batch encoded input
#[derive(Debug, Clone)]
pub struct BatchEncodedInput {
    /// Flattened token IDs [batch_size * seq_len]
    pub input_ids: Vec<u32>,
    /// Flattened attention mask
    pub attention_mask: Vec<u32>,
    /// Batch size
    pub batch_size: usize,
    /// Sequence length (after padding)
    pub seq_len: usize,
}

impl BatchEncodedInput {
    /// Convert to tensors [batch_size, seq_len]
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let input_ids = Tensor::new(&self.input_ids[..], device)?
            .reshape((self.batch_size, self.seq_len))?;

        let attention_mask = Tensor::new(&self.attention_mask[..], device)?
            .to_dtype(DType::F32)?
            .reshape((self.batch_size, self.seq_len))?;

        Ok((input_ids, attention_mask))
    }
}
