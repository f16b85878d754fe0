//! Causal language models and tokenizers used for fine-tuning

mod common;
mod decoders;
mod tokenizer;

pub use common::{
    detect_architecture, CausalLanguageModel, DecoderConfig, LoraModel, ModelArchitecture,
};
pub use decoders::{DecoderCache, DecoderLoraModel};
pub use tokenizer::{BatchEncodedInput, EncodedInput, TokenizerWrapper};

use anyhow::Result;

/// Tokenizer ids must index into the model's embedding table
pub fn check_vocab_compat(tokenizer: &TokenizerWrapper, model_vocab_size: usize) -> Result<()> {
    let tokenizer_vocab = tokenizer.vocab_size();
    if tokenizer_vocab > model_vocab_size {
        anyhow::bail!(
            "Tokenizer vocabulary ({}) exceeds model vocab_size ({})",
            tokenizer_vocab,
            model_vocab_size
        );
    }
    Ok(())
}

/// Tiny on-disk models and tokenizers for tests
#[cfg(test)]
pub(crate) mod test_utils {
    use super::TokenizerWrapper;
    use crate::training::hub::ModelPath;
    use candle_core::{DType, Device, Tensor};
    use std::collections::HashMap;
    use std::path::Path;
    use std::str::FromStr;

    pub const TINY_LAYERS: usize = 2;
    pub const TINY_VOCAB: usize = 32;
    const HIDDEN: usize = 64;
    const INTERMEDIATE: usize = 128;
    const HEADS: usize = 4;
    const KV_HEADS: usize = 2;

    const WORDS: [&str; 24] = [
        "<unk>", "<s>", "</s>", "hello", "world", "foo", "bar", "def", "print", "prime",
        "return", "the", "a", "is", "number", "of", "(", ")", ":", "n", "[INST]", "[/INST]",
        "what", "rust",
    ];

    pub fn tokenizer_json() -> String {
        let words: Vec<String> = WORDS.iter().map(|w| w.to_string()).collect();
        word_level_json(&words)
    }

    fn word_level_json(words: &[String]) -> String {
        let vocab: serde_json::Map<String, serde_json::Value> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), serde_json::json!(i)))
            .collect();
        let added: Vec<serde_json::Value> = WORDS[..3]
            .iter()
            .enumerate()
            .map(|(i, w)| {
                serde_json::json!({
                    "id": i, "content": w, "single_word": false, "lstrip": false,
                    "rstrip": false, "normalized": false, "special": true
                })
            })
            .collect();

        serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": added,
            "normalizer": null,
            "pre_tokenizer": { "type": "WhitespaceSplit" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
        })
        .to_string()
    }

    pub fn tiny_tokenizer() -> TokenizerWrapper {
        let tokenizer = tokenizers::Tokenizer::from_str(&tokenizer_json()).unwrap();
        TokenizerWrapper::new(tokenizer)
    }

    pub fn write_tiny_tokenizer(dir: &Path) {
        std::fs::write(dir.join("tokenizer.json"), tokenizer_json()).unwrap();
    }

    /// Replace the tokenizer with one whose vocabulary exceeds `TINY_VOCAB`
    pub fn write_oversized_tokenizer(dir: &Path) {
        let words: Vec<String> = WORDS
            .iter()
            .map(|w| w.to_string())
            .chain((WORDS.len()..TINY_VOCAB + 8).map(|i| format!("w{}", i)))
            .collect();
        std::fs::write(dir.join("tokenizer.json"), word_level_json(&words)).unwrap();
    }

    /// Random-weight llama checkpoint in a temp dir
    pub fn tiny_model_path() -> (tempfile::TempDir, ModelPath) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let device = Device::Cpu;

        let config = serde_json::json!({
            "architectures": ["LlamaForCausalLM"],
            "model_type": "llama",
            "hidden_size": HIDDEN,
            "intermediate_size": INTERMEDIATE,
            "vocab_size": TINY_VOCAB,
            "num_hidden_layers": TINY_LAYERS,
            "num_attention_heads": HEADS,
            "num_key_value_heads": KV_HEADS,
            "rms_norm_eps": 1e-5,
            "max_position_embeddings": 128,
            "tie_word_embeddings": false,
            "torch_dtype": "float32"
        });
        std::fs::write(root.join("config.json"), config.to_string()).unwrap();
        write_tiny_tokenizer(root);
        std::fs::write(root.join("tokenizer_config.json"), r#"{"eos_token": "</s>"}"#).unwrap();

        let head_dim = HIDDEN / HEADS;
        let kv_dim = KV_HEADS * head_dim;
        let rand = |shape: (usize, usize)| Tensor::randn(0f32, 0.05, shape, &device).unwrap();
        let ones = |n: usize| Tensor::ones(n, DType::F32, &device).unwrap();

        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        tensors.insert("model.embed_tokens.weight".into(), rand((TINY_VOCAB, HIDDEN)));
        tensors.insert("lm_head.weight".into(), rand((TINY_VOCAB, HIDDEN)));
        tensors.insert("model.norm.weight".into(), ones(HIDDEN));
        for i in 0..TINY_LAYERS {
            let p = format!("model.layers.{}", i);
            tensors.insert(format!("{p}.self_attn.q_proj.weight"), rand((HIDDEN, HIDDEN)));
            tensors.insert(format!("{p}.self_attn.k_proj.weight"), rand((kv_dim, HIDDEN)));
            tensors.insert(format!("{p}.self_attn.v_proj.weight"), rand((kv_dim, HIDDEN)));
            tensors.insert(format!("{p}.self_attn.o_proj.weight"), rand((HIDDEN, HIDDEN)));
            tensors.insert(format!("{p}.mlp.gate_proj.weight"), rand((INTERMEDIATE, HIDDEN)));
            tensors.insert(format!("{p}.mlp.up_proj.weight"), rand((INTERMEDIATE, HIDDEN)));
            tensors.insert(format!("{p}.mlp.down_proj.weight"), rand((HIDDEN, INTERMEDIATE)));
            tensors.insert(format!("{p}.input_layernorm.weight"), ones(HIDDEN));
            tensors.insert(format!("{p}.post_attention_layernorm.weight"), ones(HIDDEN));
        }
        candle_core::safetensors::save(&tensors, root.join("model.safetensors")).unwrap();

        let path = ModelPath::from_local(root).unwrap();
        (dir, path)
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::{tiny_tokenizer, TINY_VOCAB};
    use super::*;

    #[test]
    fn test_vocab_compat() {
        let tokenizer = tiny_tokenizer();
        assert!(check_vocab_compat(&tokenizer, TINY_VOCAB).is_ok());
        assert!(check_vocab_compat(&tokenizer, 4).is_err());
    }
}
