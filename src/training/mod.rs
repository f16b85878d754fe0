//! Fine-tuning with LoRA/QLoRA
//!
//! Supervised fine-tuning of causal language models with Candle.
//!
//! For GPU support:
//! ```bash
//! cargo build --features cuda    # NVIDIA GPU
//! cargo build --features metal   # Apple GPU
//! ```
//!
//! # Modules
//!
//! - `device` - CPU/CUDA/Metal device abstraction and GPU reports
//! - `hub` - HuggingFace Hub integration
//! - `dataset` - Dataset loading and batching
//! - `models` - Decoder model with LoRA adapters, tokenizer wrapper
//! - `lora` - LoRA adapter layers and PEFT adapter files
//! - `quant` - Quantized frozen base weights
//! - `loss` - Causal language modeling loss
//! - `optimizer` - AdamW optimizer and learning rate schedules
//! - `checkpoint` - Periodic checkpoints
//! - `config` - Fine-tuning recipes
//! - `trainer` - Training loop

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod device;
pub mod hub;
pub mod lora;
pub mod loss;
pub mod models;
pub mod optimizer;
pub mod quant;
pub mod trainer;

// Re-exports
pub use config::{FinetuneConfig, Preset};
pub use dataset::{DatasetConfig, TextDataset, TextExample};
pub use device::{select_device, DevicePreference};
pub use hub::HubApi;
pub use lora::LoraConfig;
pub use models::{DecoderLoraModel, TokenizerWrapper};
pub use quant::QuantizationConfig;
pub use trainer::{Trainer, TrainingConfig, TrainingResult};
