//! Command-line interface
//!
//! Provides CLI commands for gpu, generate, and finetune.

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

use crate::generation::{create_generator, GeneratorConfig, SamplingParams, DEFAULT_PROMPT};
use crate::training::config::{FinetuneConfig, Preset};
use crate::training::dataset::{DatasetConfig, TextDataset};
use crate::training::device::{device_info, gpu_report, select_device, DevicePreference};
use crate::training::hub::ModelLoader;
use crate::training::models::{check_vocab_compat, DecoderLoraModel, LoraModel, TokenizerWrapper};
use crate::training::trainer::{Trainer, TrainingResult};

/// Arguments of the generate command
#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    /// Model name or path (HuggingFace model ID or local path)
    #[arg(short, long, env = "LMTUNE_MODEL", default_value = "microsoft/phi-2")]
    pub model: String,

    /// Prompt text (defaults to a Python docstring completion)
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Adapter directory written by `finetune`
    #[arg(short, long)]
    pub adapter: Option<PathBuf>,

    /// Device: auto, cpu, cuda, or metal
    #[arg(short, long, default_value = "auto")]
    pub device: DevicePreference,

    /// Weight dtype: auto, f32, f16, or bf16
    #[arg(long, default_value = "auto")]
    pub dtype: String,

    /// Total token limit, prompt included
    #[arg(long, default_value = "200")]
    pub max_length: usize,

    /// New token limit (overrides --max-length)
    #[arg(long)]
    pub max_new_tokens: Option<usize>,

    /// Sampling temperature (0 = greedy)
    #[arg(long, default_value = "0.0")]
    pub temperature: f32,

    /// Nucleus sampling threshold
    #[arg(long, default_value = "1.0")]
    pub top_p: f32,

    /// Top-k sampling (0 = disabled)
    #[arg(long, default_value = "0")]
    pub top_k: usize,

    /// Repetition penalty (1.0 = none)
    #[arg(long, default_value = "1.0")]
    pub repetition_penalty: f32,

    /// Sampling seed
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Stop once the completion contains this text (repeatable)
    #[arg(long = "stop")]
    pub stop: Vec<String>,

    /// Recompute the full sequence at every step
    #[arg(long)]
    pub no_kv_cache: bool,
}

impl GenerateArgs {
    pub fn generator_config(&self) -> GeneratorConfig {
        let mut config = GeneratorConfig::new(&self.model)
            .with_device(self.device)
            .with_dtype(&self.dtype)
            .with_kv_cache(!self.no_kv_cache);
        if let Some(adapter) = &self.adapter {
            config = config.with_adapter(adapter);
        }
        config
    }

    pub fn sampling_params(&self) -> SamplingParams {
        let mut params = SamplingParams::greedy()
            .with_temperature(self.temperature)
            .with_top_p(self.top_p)
            .with_top_k(self.top_k)
            .with_max_length(self.max_length)
            .with_stop_sequences(self.stop.clone())
            .with_seed(self.seed);
        params.repetition_penalty = self.repetition_penalty;
        params.max_new_tokens = self.max_new_tokens;
        params
    }
}

/// Arguments of the finetune command
#[derive(Args, Debug, Clone, Default)]
pub struct FinetuneArgs {
    /// Built-in recipe the run starts from
    #[arg(long, value_enum, default_value_t = Preset::Qlora)]
    pub preset: Preset,

    /// TOML or JSON file layered over the preset
    #[arg(short, long, env = "LMTUNE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Base model (local directory or hub id)
    #[arg(long)]
    pub base_model: Option<String>,

    /// Directory the final adapter is written to
    #[arg(long)]
    pub new_model: Option<String>,

    /// Dataset hub id or local .jsonl/.json/.csv/.parquet file
    #[arg(long)]
    pub dataset: Option<String>,

    /// Checkpoint directory
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long)]
    pub device: Option<DevicePreference>,

    #[arg(long)]
    pub epochs: Option<usize>,

    /// Stop after this many optimizer steps
    #[arg(long)]
    pub max_steps: Option<i64>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Only use the first N records
    #[arg(long)]
    pub max_examples: Option<usize>,

    /// Disable 4-bit quantization of the base model
    #[arg(long)]
    pub no_quantize: bool,
}

impl FinetuneArgs {
    /// Resolve preset, file, environment, then these flags
    pub fn resolve(&self) -> Result<FinetuneConfig> {
        let mut config = FinetuneConfig::load(self.preset, self.config.as_deref())?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut FinetuneConfig) {
        if let Some(base_model) = &self.base_model {
            config.base_model = base_model.clone();
        }
        if let Some(new_model) = &self.new_model {
            config.new_model = new_model.clone();
        }
        if let Some(dataset) = &self.dataset {
            config.dataset.name = dataset.clone();
        }
        if let Some(output_dir) = &self.output_dir {
            config.training.output_dir = output_dir.clone();
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(epochs) = self.epochs {
            config.training.num_train_epochs = epochs;
        }
        if let Some(max_steps) = self.max_steps {
            config.training.max_steps = max_steps;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.per_device_train_batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.training.learning_rate = learning_rate;
        }
        if let Some(max_examples) = self.max_examples {
            config.dataset.max_examples = Some(max_examples);
        }
        if self.no_quantize {
            config.quantization.enabled = false;
        }
    }
}

/// Execute the gpu command
pub fn gpu() -> Result<()> {
    let report = gpu_report();
    println!("{}", report);
    if !report.gpu_available() {
        tracing::warn!("No GPU backend initialised; generation and fine-tuning will run on CPU");
    }
    Ok(())
}

/// Execute the generate command
pub fn generate(args: GenerateArgs) -> Result<()> {
    let prompt = args.prompt.clone().unwrap_or_else(|| DEFAULT_PROMPT.to_string());

    tracing::info!("Running generation");
    tracing::info!("  Model: {}", args.model);
    if let Some(adapter) = &args.adapter {
        tracing::info!("  Adapter: {}", adapter.display());
    }

    let generator = create_generator(args.generator_config())?;
    let text = generator.generate_full(&prompt, &args.sampling_params())?;
    println!("{}", text);
    Ok(())
}

/// Execute the finetune command
pub fn finetune(args: FinetuneArgs) -> Result<()> {
    let config = args.resolve()?;
    let result = run_finetune(&config)?;

    println!("\nTraining Summary:");
    println!("  Optimizer steps: {}", result.metrics.global_step);
    println!("  Train loss: {:.4}", result.train_loss);
    println!("  Runtime: {:.1}s", result.train_runtime);
    if let Some(checkpoint) = &result.checkpoint_path {
        println!("  Last checkpoint: {}", checkpoint.display());
    }
    println!("  Adapter saved to: {}", config.new_model);
    Ok(())
}

/// Load data and model, train the adapter, save it to `new_model`
pub fn run_finetune(config: &FinetuneConfig) -> Result<TrainingResult> {
    tracing::info!("Starting fine-tuning run");
    tracing::info!("  Base model: {}", config.base_model);
    tracing::info!("  Dataset: {} ({})", config.dataset.name, config.dataset.split);
    tracing::info!("  Quantized base: {}", config.quantization.enabled);

    let device = select_device(config.device)?;
    let info = device_info(&device);
    tracing::info!("  Device: {} ({})", info.name, info.device_type);

    let dataset = TextDataset::load_source(
        &config.dataset.name,
        &config.dataset.split,
        DatasetConfig {
            text_field: config.dataset.text_field.clone(),
            max_examples: config.dataset.max_examples,
            ..Default::default()
        },
    )?;
    let (rows, columns) = dataset.shape();
    println!("({}, {})", rows, columns);
    match dataset.preview(config.dataset.preview_index) {
        Some(record) => println!("{}", record),
        None => tracing::warn!(
            "Dataset has no record at index {}",
            config.dataset.preview_index
        ),
    }

    let model_path = ModelLoader::for_reference(&config.base_model)?.load_model_path(&config.base_model)?;

    let tokenizer = TokenizerWrapper::from_model_path(&model_path)?
        .with_pad_token_from_eos()?
        .with_max_length(config.training.max_seq_length);

    let model = DecoderLoraModel::from_model_path(
        &model_path,
        &config.lora,
        &config.quantization,
        config.model_dtype(),
        &device,
    )?;
    check_vocab_compat(&tokenizer, model.config().vocab_size)?;
    println!("{}", model.lora_stats());

    let trainer = Trainer::new(config.training.clone(), device);
    let result = trainer.train(&model, &tokenizer, &dataset, None)?;

    let new_model = Path::new(&config.new_model);
    std::fs::create_dir_all(new_model)
        .with_context(|| format!("Failed to create adapter directory {:?}", new_model))?;
    model.save_adapter(new_model)?;
    tracing::info!("Saved adapter to {:?}", new_model);

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::lora::{AdapterConfig, ADAPTER_WEIGHTS_FILE};
    use crate::training::models::test_utils::{tiny_model_path, write_oversized_tokenizer};
    use clap::Parser;
    use std::io::Write;

    #[derive(Parser)]
    struct GenerateCli {
        #[command(flatten)]
        args: GenerateArgs,
    }

    /// Two-step QLoRA run over a three-record JSONL file next to the model
    fn tiny_run(dir: &Path, model_dir: &Path) -> FinetuneConfig {
        let data = dir.join("train.jsonl");
        let mut file = std::fs::File::create(&data).unwrap();
        for text in [
            "<s> [INST] what is rust [/INST] a number </s>",
            "<s> hello world </s>",
            "<s> def print prime ( n ) : </s>",
        ] {
            writeln!(file, "{}", serde_json::json!({ "text": text })).unwrap();
        }

        let mut config = FinetuneConfig::preset(Preset::Qlora);
        config.base_model = model_dir.to_string_lossy().to_string();
        config.new_model = dir.join("adapter").to_string_lossy().to_string();
        config.device = DevicePreference::Cpu;
        config.dataset.name = data.to_string_lossy().to_string();
        config.training.output_dir = dir.join("results");
        config.training.per_device_train_batch_size = 2;
        config.training.max_steps = 2;
        config.training.logging_steps = 1;
        config.training.save_steps = 1;
        config.training.save_total_limit = Some(1);
        config
    }

    #[test]
    fn test_generate_args_map_to_greedy_defaults() {
        let args = GenerateArgs {
            model: "microsoft/phi-2".to_string(),
            prompt: None,
            adapter: None,
            device: DevicePreference::Cpu,
            dtype: "auto".to_string(),
            max_length: 200,
            max_new_tokens: None,
            temperature: 0.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            seed: 42,
            stop: vec![],
            no_kv_cache: false,
        };

        let params = args.sampling_params();
        assert_eq!(params.max_length, 200);
        assert_eq!(params.temperature, 0.0);
        assert!(params.stop_sequences.is_empty());
        let config = args.generator_config();
        assert!(config.use_kv_cache);
        assert!(config.adapter.is_none());
    }

    #[test]
    fn test_flags_override_preset() {
        let args = FinetuneArgs {
            preset: Preset::Lora,
            batch_size: Some(2),
            max_steps: Some(10),
            no_quantize: true,
            new_model: Some("out".to_string()),
            ..Default::default()
        };
        let mut config = FinetuneConfig::preset(Preset::Qlora);
        args.apply(&mut config);

        assert_eq!(config.training.per_device_train_batch_size, 2);
        assert_eq!(config.training.max_steps, 10);
        assert!(!config.quantization.enabled);
        assert_eq!(config.new_model, "out");
    }

    #[test]
    fn test_stop_flag_is_repeatable() {
        let cli = GenerateCli::parse_from(["generate", "--stop", "\n\n", "--stop", "END", "-p", "hi"]);
        let params = cli.args.sampling_params();
        assert_eq!(params.stop_sequences, vec!["\n\n".to_string(), "END".to_string()]);
        assert_eq!(cli.args.prompt.as_deref(), Some("hi"));
    }

    #[test]
    fn test_run_finetune_rejects_oversized_tokenizer() {
        let (dir, path) = tiny_model_path();
        write_oversized_tokenizer(dir.path());
        let config = tiny_run(dir.path(), &path.path);

        let err = run_finetune(&config).unwrap_err();
        assert!(err.to_string().contains("exceeds model vocab_size"));
        assert!(!dir.path().join("results").exists());
    }

    #[test]
    fn test_run_finetune_end_to_end() {
        let (dir, path) = tiny_model_path();
        let config = tiny_run(dir.path(), &path.path);
        let new_model = dir.path().join("adapter");

        let result = run_finetune(&config).unwrap();
        assert_eq!(result.metrics.global_step, 2);
        assert!(new_model.join(ADAPTER_WEIGHTS_FILE).exists());
        assert_eq!(AdapterConfig::load(&new_model).unwrap().r, 8);

        let checkpoints: Vec<_> = std::fs::read_dir(dir.path().join("results")).unwrap().collect();
        assert_eq!(checkpoints.len(), 1);
    }
}
