//! Decoder model implementations for training
//!
//! This module provides LoRA-enabled decoder models for fine-tuning
//! causal language models like LLaMA, Mistral and Qwen2.

mod decoder_lora;

pub use decoder_lora::{DecoderCache, DecoderLoraModel};
