//! Candle-based decoder model implementation
//!
//! Supports Phi, Qwen2 and Llama-family checkpoints via candle-transformers,
//! and fine-tuned adapters via [`DecoderLoraModel`].

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{Cache as LlamaCache, Config as LlamaRuntimeConfig, Llama, LlamaConfig};
use candle_transformers::models::phi::{Config as PhiConfig, Model as PhiModel};
use candle_transformers::models::qwen2::{Config as Qwen2Config, ModelForCausalLM as Qwen2Model};
use std::path::Path;
use std::sync::Mutex;

use super::{Generator, GeneratorConfig, SamplingParams};
use crate::training::hub::{ModelLoader, ModelPath};
use crate::training::models::{check_vocab_compat, detect_architecture, DecoderCache, DecoderLoraModel, ModelArchitecture};
use crate::training::quant::QuantizationConfig;
use crate::training::{select_device, TokenizerWrapper};

/// Candle-based text generator supporting multiple architectures
pub struct CandleGenerator {
    /// Model wrapped in Mutex for interior mutability (required for KV cache)
    model: Mutex<GeneratorModel>,
    tokenizer: TokenizerWrapper,
    config: GeneratorConfig,
    device: Device,
    eos_token_id: Option<u32>,
}

/// Loaded model together with its decoding state
enum GeneratorModel {
    Phi(PhiModel),
    Qwen2(Qwen2Model),
    Llama {
        model: Llama,
        cache: LlamaCache,
        config: LlamaRuntimeConfig,
        dtype: DType,
    },
    Adapted {
        model: DecoderLoraModel,
        cache: DecoderCache,
    },
}

impl GeneratorModel {
    fn name(&self) -> &'static str {
        match self {
            Self::Phi(_) => "phi",
            Self::Qwen2(_) => "qwen2",
            Self::Llama { .. } => "llama",
            Self::Adapted { .. } => "llama+adapter",
        }
    }

    /// Drop all cached keys and values
    fn reset(&mut self, use_kv_cache: bool, device: &Device) -> Result<()> {
        match self {
            Self::Phi(model) => model.clear_kv_cache(),
            Self::Qwen2(model) => model.clear_kv_cache(),
            Self::Llama {
                cache,
                config,
                dtype,
                ..
            } => *cache = LlamaCache::new(use_kv_cache, *dtype, config, device)?,
            Self::Adapted { cache, .. } => cache.reset(),
        }
        Ok(())
    }

    /// Logits of the last position, as a 1-D f32 tensor
    fn forward(&mut self, input_ids: &Tensor, offset: usize, use_kv_cache: bool) -> Result<Tensor> {
        let logits = match self {
            Self::Phi(model) => model.forward(input_ids)?,
            Self::Qwen2(model) => model.forward(input_ids, offset)?,
            Self::Llama { model, cache, .. } => model.forward(input_ids, offset, cache)?,
            Self::Adapted { model, cache } => {
                let cache = use_kv_cache.then_some(cache);
                model.forward(input_ids, offset, cache, false)?
            }
        };
        last_token_logits(&logits)
    }
}

/// Logits of the last position of a single prompt as `[vocab]`
fn last_token_logits(logits: &Tensor) -> Result<Tensor> {
    let logits = logits.to_dtype(DType::F32)?;
    match logits.rank() {
        1 => Ok(logits),
        2 => Ok(logits.get(0)?),
        3 => {
            let last = logits.dim(1)? - 1;
            Ok(logits.get(0)?.get(last)?)
        }
        rank => anyhow::bail!("Unexpected logits rank {}", rank),
    }
}

impl CandleGenerator {
    /// Create a new Candle generator from config
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        let device = select_device(config.device)?;

        let model_path =
            ModelLoader::for_reference(&config.model_id)?.load_model_path(&config.model_id)?;

        Self::from_model_path(config, &model_path, device)
    }

    /// Create a generator from an already resolved checkpoint
    pub fn from_model_path(config: GeneratorConfig, model_path: &ModelPath, device: Device) -> Result<Self> {
        let hub_config = model_path.hub_config()?;
        let dtype = config.resolve_dtype(hub_config.torch_dtype.as_deref(), &device)?;

        tracing::info!("Loading generator model: {}", config.model_id);
        tracing::info!("  Device: {:?}", device);
        tracing::info!("  Dtype: {:?}", dtype);
        tracing::info!("  KV cache: {}", config.use_kv_cache);

        let tokenizer = TokenizerWrapper::from_model_path(model_path)
            .context("Failed to load tokenizer")?
            .with_max_length(config.max_seq_length);
        if let Some(vocab_size) = hub_config.vocab_size {
            check_vocab_compat(&tokenizer, vocab_size)?;
        }

        let eos_token_id = match tokenizer.eos_token_id() {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("No EOS token ({}); generation stops only at the length limit", e);
                None
            }
        };

        let architecture =
            detect_architecture(hub_config.model_type.as_deref(), &hub_config.architectures)?;
        let model = Self::load_model(&config, model_path, architecture, dtype, &device)?;
        tracing::info!("Generator loaded successfully ({})", model.name());

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            config,
            device,
            eos_token_id,
        })
    }

    fn load_model(
        config: &GeneratorConfig,
        model_path: &ModelPath,
        architecture: ModelArchitecture,
        dtype: DType,
        device: &Device,
    ) -> Result<GeneratorModel> {
        if let Some(adapter) = &config.adapter {
            return Self::load_adapted(model_path, adapter, dtype, device);
        }

        let config_str = std::fs::read_to_string(&model_path.config_file)
            .context("Failed to read model config")?;

        tracing::info!("Detected architecture: {}", architecture);

        let weight_refs: Vec<&Path> = model_path.weights_files.iter().map(|p| p.as_path()).collect();
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&weight_refs, dtype, device)
                .context("Failed to load model weights")?
        };

        match architecture {
            ModelArchitecture::Phi => {
                let phi_config: PhiConfig =
                    serde_json::from_str(&config_str).context("Failed to parse Phi config")?;
                let model = PhiModel::new(&phi_config, vb).context("Failed to create Phi model")?;
                Ok(GeneratorModel::Phi(model))
            }
            ModelArchitecture::Qwen2 => {
                let qwen_config: Qwen2Config =
                    serde_json::from_str(&config_str).context("Failed to parse Qwen2 config")?;

                tracing::info!(
                    "Loading Qwen2: vocab={}, hidden={}, layers={}",
                    qwen_config.vocab_size,
                    qwen_config.hidden_size,
                    qwen_config.num_hidden_layers
                );

                let model = Qwen2Model::new(&qwen_config, vb).context("Failed to create Qwen2 model")?;
                Ok(GeneratorModel::Qwen2(model))
            }
            ModelArchitecture::Llama | ModelArchitecture::Mistral => {
                let llama_config: LlamaConfig =
                    serde_json::from_str(&config_str).context("Failed to parse Llama config")?;
                let llama_config = llama_config.into_config(false);
                let model = Llama::load(vb, &llama_config).context("Failed to create Llama model")?;
                let cache = LlamaCache::new(config.use_kv_cache, dtype, &llama_config, device)?;
                Ok(GeneratorModel::Llama {
                    model,
                    cache,
                    config: llama_config,
                    dtype,
                })
            }
        }
    }

    fn load_adapted(
        model_path: &ModelPath,
        adapter: &Path,
        dtype: DType,
        device: &Device,
    ) -> Result<GeneratorModel> {
        tracing::info!("Applying adapter from {:?}", adapter);

        let mut model = DecoderLoraModel::with_adapter(
            model_path,
            adapter,
            &QuantizationConfig::default(),
            dtype,
            device,
        )?;
        model.merge_adapters()?;
        let cache = model.new_cache();
        Ok(GeneratorModel::Adapted { model, cache })
    }

    /// Prompt tokens followed by generated tokens
    fn generate_tokens(&self, prompt: &str, params: &SamplingParams) -> Result<(Vec<u32>, usize)> {
        if prompt.trim().is_empty() {
            anyhow::bail!("Prompt is empty");
        }

        let prompt_tokens = self.tokenizer.encode(prompt, true)?.input_ids;
        let prompt_len = prompt_tokens.len();
        if prompt_len == 0 {
            anyhow::bail!("Empty prompt after tokenization");
        }

        let room = self.config.max_seq_length.saturating_sub(prompt_len);
        let max_new_tokens = params.new_token_budget(prompt_len).min(room);
        if max_new_tokens == 0 {
            tracing::warn!(
                "Prompt has {} tokens, leaving no room under the length limit; nothing generated",
                prompt_len
            );
            return Ok((prompt_tokens, prompt_len));
        }

        let mut logits_processor = LogitsProcessor::from_sampling(params.seed, params.sampling());
        let use_kv_cache = self.config.use_kv_cache;
        let mut all_tokens = prompt_tokens;

        let mut model = self
            .model
            .lock()
            .map_err(|e| anyhow::anyhow!("Model lock poisoned: {}", e))?;
        model.reset(use_kv_cache, &self.device)?;

        let mut pos = 0;
        for _ in 0..max_new_tokens {
            let (context, offset) = if use_kv_cache {
                (&all_tokens[pos..], pos)
            } else {
                model.reset(false, &self.device)?;
                (&all_tokens[..], 0)
            };
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = model.forward(&input, offset, use_kv_cache)?;
            pos = all_tokens.len();

            let logits = if params.repetition_penalty != 1.0 {
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    params.repetition_penalty,
                    &all_tokens,
                )?
            } else {
                logits
            };

            let next_token = logits_processor.sample(&logits)?;
            all_tokens.push(next_token);

            if Some(next_token) == self.eos_token_id {
                tracing::debug!("Generation stopped: EOS token");
                break;
            }

            if !params.stop_sequences.is_empty() {
                let generated = self.tokenizer.decode(&all_tokens[prompt_len..], true)?;
                if params.stop_sequences.iter().any(|s| generated.contains(s)) {
                    tracing::debug!("Generation stopped: stop sequence");
                    break;
                }
            }
        }

        tracing::debug!(
            "Generated {} tokens after a {}-token prompt",
            all_tokens.len() - prompt_len,
            prompt_len
        );
        Ok((all_tokens, prompt_len))
    }
}

impl Generator for CandleGenerator {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String> {
        let (tokens, prompt_len) = self.generate_tokens(prompt, params)?;
        let output = self.tokenizer.decode(&tokens[prompt_len..], true)?;
        Ok(output.trim().to_string())
    }

    fn generate_full(&self, prompt: &str, params: &SamplingParams) -> Result<String> {
        let (tokens, _) = self.generate_tokens(prompt, params)?;
        self.tokenizer.decode(&tokens, false)
    }

    fn model_name(&self) -> &str {
        &self.config.model_id
    }

    fn count_tokens(&self, text: &str) -> Result<usize> {
        let encoded = self.tokenizer.encode(text, false)?;
        Ok(encoded.input_ids.len())
    }
}
