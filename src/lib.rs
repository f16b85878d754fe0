//! # lmtune
//!
//! GPU queries, causal-LM text generation and LoRA/QLoRA fine-tuning
//! built on Candle.
//!
//! ## Architecture
//!
//! - `training` - devices, hub access, datasets, LoRA models and the trainer
//! - `generation` - text generation with pretrained or adapted models
//! - `cli` - Command-line interface
//! - `utils` - Common utilities

pub mod cli;
pub mod generation;
pub mod training;
pub mod utils;

// Re-export commonly used types
pub use anyhow::{Error, Result};
