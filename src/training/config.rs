//! Fine-tuning recipes
//!
//! A run is described by a [`FinetuneConfig`]. Values are layered:
//! named preset, then an optional TOML/JSON file, then `LMTUNE__*`
//! environment variables (e.g. `LMTUNE__TRAINING__LEARNING_RATE=1e-4`),
//! then command-line overrides applied by the caller.

use anyhow::{Context, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::training::device::DevicePreference;
use crate::training::lora::LoraConfig;
use crate::training::optimizer::{OptimizerKind, SchedulerType};
use crate::training::quant::QuantizationConfig;
use crate::training::trainer::TrainingConfig;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "LMTUNE";

/// Built-in recipes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Preset {
    /// LoRA on the full-precision Llama-2-7b base
    Lora,
    /// QLoRA: 4-bit Llama-2-7b-chat base, batch size 4
    #[default]
    Qlora,
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lora => write!(f, "lora"),
            Self::Qlora => write!(f, "qlora"),
        }
    }
}

/// Training data source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSection {
    /// Hub dataset id or local file
    pub name: String,
    pub split: String,
    pub text_field: String,
    pub max_examples: Option<usize>,
    /// Record printed after loading
    pub preview_index: usize,
}

impl Default for DatasetSection {
    fn default() -> Self {
        Self {
            name: "mlabonne/guanaco-llama2-1k".to_string(),
            split: "train".to_string(),
            text_field: "text".to_string(),
            max_examples: None,
            preview_index: 11,
        }
    }
}

/// Everything needed for one fine-tuning run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneConfig {
    /// Base checkpoint (local directory or hub id)
    pub base_model: String,
    /// Directory the final adapter is saved to
    pub new_model: String,
    pub device: DevicePreference,
    pub dataset: DatasetSection,
    pub lora: LoraConfig,
    pub quantization: QuantizationConfig,
    pub training: TrainingConfig,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self::preset(Preset::default())
    }
}

impl FinetuneConfig {
    /// Values of a built-in recipe
    pub fn preset(preset: Preset) -> Self {
        let shared = TrainingConfig {
            output_dir: "./results".into(),
            num_train_epochs: 1,
            gradient_accumulation_steps: 1,
            optim: "paged_adamw_32bit".to_string(),
            save_steps: 50,
            logging_steps: 50,
            weight_decay: 0.001,
            fp16: false,
            bf16: false,
            max_grad_norm: 0.3,
            max_steps: -1,
            warmup_ratio: 0.03,
            group_by_length: true,
            lr_scheduler_type: SchedulerType::Constant,
            ..TrainingConfig::default()
        };

        match preset {
            Preset::Lora => Self {
                base_model: "/DATA/NousResearch/Llama-2-7b-hf/".to_string(),
                new_model: "llama-2-7b-enhanced".to_string(),
                device: DevicePreference::Auto,
                dataset: DatasetSection::default(),
                lora: LoraConfig::default(),
                quantization: QuantizationConfig::default(),
                training: TrainingConfig {
                    per_device_train_batch_size: 1,
                    learning_rate: 4e-5,
                    ..shared
                },
            },
            Preset::Qlora => Self {
                base_model: "/DATA/NousResearch/Llama-2-7b-chat-hf/".to_string(),
                new_model: "llama-2-7b-chat-enhanced".to_string(),
                device: DevicePreference::Auto,
                dataset: DatasetSection::default(),
                lora: LoraConfig::default(),
                quantization: QuantizationConfig::four_bit(),
                training: TrainingConfig {
                    per_device_train_batch_size: 4,
                    learning_rate: 2e-4,
                    ..shared
                },
            },
        }
    }

    /// Layer a config file and the environment over a preset
    pub fn load(preset: Preset, file: Option<&Path>) -> Result<Self> {
        let base = config::Config::try_from(&Self::preset(preset))
            .context("Failed to serialize preset")?;

        let mut builder = config::Config::builder().add_source(base);
        if let Some(path) = file {
            if !path.exists() {
                anyhow::bail!("Config file not found: {:?}", path);
            }
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("lora.target_modules"),
        );

        let config: Self = builder
            .build()
            .context("Failed to build fine-tune configuration")?
            .try_deserialize()
            .context("Invalid fine-tune configuration")?;

        tracing::debug!("Resolved fine-tune config: {:?}", config);
        Ok(config)
    }

    /// Dtype the base model weights are loaded in
    pub fn model_dtype(&self) -> DType {
        if self.training.bf16 {
            DType::BF16
        } else if self.training.fp16 {
            DType::F16
        } else {
            DType::F32
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.lora.validate()?;
        self.quantization.compute_dtype()?;
        self.training.optim.parse::<OptimizerKind>()?;

        let t = &self.training;
        if t.per_device_train_batch_size == 0 {
            anyhow::bail!("per_device_train_batch_size must be greater than 0");
        }
        if t.gradient_accumulation_steps == 0 {
            anyhow::bail!("gradient_accumulation_steps must be greater than 0");
        }
        if t.learning_rate <= 0.0 {
            anyhow::bail!("learning_rate must be positive, got {}", t.learning_rate);
        }
        if t.num_train_epochs == 0 && t.max_steps <= 0 {
            anyhow::bail!("num_train_epochs must be greater than 0 unless max_steps is set");
        }
        if !(0.0..=1.0).contains(&t.warmup_ratio) {
            anyhow::bail!("warmup_ratio must be in [0, 1], got {}", t.warmup_ratio);
        }
        if t.max_seq_length == 0 {
            anyhow::bail!("max_seq_length must be greater than 0");
        }
        if t.fp16 && t.bf16 {
            anyhow::bail!("fp16 and bf16 are mutually exclusive");
        }
        if self.dataset.text_field.trim().is_empty() {
            anyhow::bail!("dataset.text_field must not be empty");
        }
        if self.base_model.trim().is_empty() {
            anyhow::bail!("base_model must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_presets() {
        let lora = FinetuneConfig::preset(Preset::Lora);
        assert_eq!(lora.training.per_device_train_batch_size, 1);
        assert_eq!(lora.training.learning_rate, 4e-5);
        assert!(!lora.quantization.enabled);
        assert_eq!(lora.new_model, "llama-2-7b-enhanced");

        let qlora = FinetuneConfig::preset(Preset::Qlora);
        assert_eq!(qlora.training.per_device_train_batch_size, 4);
        assert_eq!(qlora.training.learning_rate, 2e-4);
        assert!(qlora.quantization.enabled);
        assert_eq!(qlora.base_model, "/DATA/NousResearch/Llama-2-7b-chat-hf/");

        for config in [lora, qlora] {
            assert_eq!(config.lora.rank, 8);
            assert_eq!(config.lora.alpha, 8.0);
            assert_eq!(config.lora.dropout, 0.1);
            assert_eq!(config.training.max_steps, -1);
            assert_eq!(config.training.max_grad_norm, 0.3);
            assert_eq!(config.training.lr_scheduler_type, SchedulerType::Constant);
            assert_eq!(config.dataset.name, "mlabonne/guanaco-llama2-1k");
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn test_file_overrides_preset() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
base_model = "/models/tiny"

[training]
learning_rate = 1e-3
save_total_limit = 2

[lora]
rank = 16
target_modules = ["q_proj", "k_proj", "v_proj"]
"#
        )
        .unwrap();

        let config = FinetuneConfig::load(Preset::Lora, Some(file.path())).unwrap();
        assert_eq!(config.base_model, "/models/tiny");
        assert_eq!(config.training.learning_rate, 1e-3);
        assert_eq!(config.training.save_total_limit, Some(2));
        assert_eq!(config.lora.rank, 16);
        assert_eq!(config.lora.target_modules.len(), 3);
        // untouched preset values survive
        assert_eq!(config.training.per_device_train_batch_size, 1);
        assert_eq!(config.new_model, "llama-2-7b-enhanced");
    }

    #[test]
    fn test_environment_overrides_file_and_preset() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[training]
logging_steps = 10
"#
        )
        .unwrap();

        std::env::set_var("LMTUNE__TRAINING__LOGGING_STEPS", "7");
        std::env::set_var("LMTUNE__TRAINING__SAVE_STEPS", "25");
        let config = FinetuneConfig::load(Preset::Qlora, Some(file.path()));
        std::env::remove_var("LMTUNE__TRAINING__LOGGING_STEPS");
        std::env::remove_var("LMTUNE__TRAINING__SAVE_STEPS");

        let config = config.unwrap();
        assert_eq!(config.training.logging_steps, 7);
        assert_eq!(config.training.save_steps, 25);
        // untouched preset values survive
        assert_eq!(config.training.per_device_train_batch_size, 4);
        assert!(config.quantization.enabled);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(FinetuneConfig::load(Preset::Lora, Some(Path::new("/no/such/run.toml"))).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = FinetuneConfig::preset(Preset::Lora);
        config.training.per_device_train_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = FinetuneConfig::preset(Preset::Lora);
        config.training.warmup_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = FinetuneConfig::preset(Preset::Lora);
        config.training.num_train_epochs = 0;
        assert!(config.validate().is_err());
        config.training.max_steps = 10;
        assert!(config.validate().is_ok());

        let mut config = FinetuneConfig::preset(Preset::Lora);
        config.training.optim = "sgd".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_dtype() {
        let mut config = FinetuneConfig::preset(Preset::Qlora);
        assert_eq!(config.model_dtype(), DType::F32);
        config.training.bf16 = true;
        assert_eq!(config.model_dtype(), DType::BF16);
    }
}
