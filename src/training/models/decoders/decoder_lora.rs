//! Decoder-only causal LM with trainable LoRA adapters
//!
//! Supports the LLaMA, Mistral and Qwen2 weight layouts. Every projection is
//! an [`AdaptedLinear`]; the ones named in `target_modules` carry adapters.
//! The forward pass is composed of differentiable tensor ops so gradients
//! reach the adapters.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{Embedding, VarBuilder, VarMap};
use std::path::Path;

use crate::training::hub::ModelPath;
use crate::training::lora::{self, AdaptedLinear, AdapterConfig, LoraConfig, LoraStats, PEFT_PREFIX};
use crate::training::models::common::{
    CausalLanguageModel, DecoderConfig, LoraModel, ModelArchitecture,
};
use crate::training::quant::{FrozenWeight, QuantizationConfig};

/// Per-layer key/value cache for incremental decoding
#[derive(Debug, Clone)]
pub struct DecoderCache {
    kvs: Vec<Option<(Tensor, Tensor)>>,
}

impl DecoderCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            kvs: vec![None; num_layers],
        }
    }

    /// Drop all cached keys and values
    pub fn reset(&mut self) {
        self.kvs.iter_mut().for_each(|kv| *kv = None);
    }

    /// Number of positions held in the cache
    pub fn seq_len(&self) -> usize {
        self.kvs
            .first()
            .and_then(|kv| kv.as_ref())
            .and_then(|(k, _)| k.dim(2).ok())
            .unwrap_or(0)
    }
}

/// Precomputed rotary tables `[max_positions, head_dim]`
#[derive(Debug)]
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &DecoderConfig, dtype: DType, device: &Device) -> Result<Self> {
        let head_dim = config.head_dim();
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1f32 / (config.rope_theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        let half = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, config.max_position_embeddings as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((config.max_position_embeddings, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            cos: emb.cos()?.to_dtype(dtype)?,
            sin: emb.sin()?.to_dtype(dtype)?,
        })
    }

    /// Rotate `x` of shape `[b, heads, t, head_dim]` starting at `offset`
    fn apply(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let seq_len = x.dim(2)?;
        let cos = self.cos.narrow(0, offset, seq_len)?.to_dtype(x.dtype())?;
        let sin = self.sin.narrow(0, offset, seq_len)?.to_dtype(x.dtype())?;
        let rotated = rotate_half(x)?;
        Ok((x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?)?)
    }
}

fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?)
}

fn rms_norm(x: &Tensor, weight: &Tensor, eps: f64) -> Result<Tensor> {
    let dtype = x.dtype();
    let x = x.to_dtype(DType::F32)?;
    let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
    let normed = x.broadcast_div(&(variance + eps)?.sqrt()?)?;
    Ok(normed.to_dtype(dtype)?.broadcast_mul(weight)?)
}

/// Additive causal mask `[t, offset + t]`
fn causal_mask(seq_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let kv_len = offset + seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..kv_len).map(move |j| if j > i + offset { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (seq_len, kv_len), device)?)
}

/// Collects every projection so parameter counts stay in one place
struct Builder<'a> {
    base: VarBuilder<'a>,
    lora: VarBuilder<'a>,
    lora_config: &'a LoraConfig,
    quant: &'a QuantizationConfig,
    num_lora_layers: usize,
}

impl<'a> Builder<'a> {
    /// Load `{prefix}.{name}` and attach an adapter when `name` is targeted
    fn projection(
        &mut self,
        prefix: &str,
        name: &str,
        (in_dim, out_dim): (usize, usize),
        with_bias: bool,
    ) -> Result<AdaptedLinear> {
        let vb = self.base.pp(prefix).pp(name);
        let weight = vb
            .get((out_dim, in_dim), "weight")
            .with_context(|| format!("Missing weight {}.{}", prefix, name))?;
        let bias = if with_bias {
            Some(vb.get(out_dim, "bias")?)
        } else {
            None
        };
        let frozen = FrozenWeight::quantize(weight, self.quant)?;

        if self.lora_config.targets(name) {
            self.num_lora_layers += 1;
            let lora_vb = self.lora.pp(prefix).pp(name);
            AdaptedLinear::with_lora(frozen, bias, self.lora_config, lora_vb)
        } else {
            Ok(AdaptedLinear::frozen(frozen, bias))
        }
    }
}

#[derive(Debug)]
struct Attention {
    q_proj: AdaptedLinear,
    k_proj: AdaptedLinear,
    v_proj: AdaptedLinear,
    o_proj: AdaptedLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(builder: &mut Builder, prefix: &str, config: &DecoderConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let q_dim = config.num_attention_heads * head_dim;
        let kv_dim = config.num_kv_heads() * head_dim;
        let bias = config.attention_bias;

        Ok(Self {
            q_proj: builder.projection(prefix, "q_proj", (hidden, q_dim), bias)?,
            k_proj: builder.projection(prefix, "k_proj", (hidden, kv_dim), bias)?,
            v_proj: builder.projection(prefix, "v_proj", (hidden, kv_dim), bias)?,
            o_proj: builder.projection(prefix, "o_proj", (q_dim, hidden), false)?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads(),
            head_dim,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        offset: usize,
        cache: Option<&mut Option<(Tensor, Tensor)>>,
        train: bool,
    ) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward_t(x, train)?
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward_t(x, train)?
            .reshape((b, t, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward_t(x, train)?
            .reshape((b, t, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = rotary.apply(&q, offset)?;
        let mut k = rotary.apply(&k, offset)?;
        let mut v = v;

        if let Some(slot) = cache {
            if let Some((prev_k, prev_v)) = slot.as_ref() {
                k = Tensor::cat(&[prev_k, &k], 2)?;
                v = Tensor::cat(&[prev_v, &v], 2)?;
            }
            *slot = Some((k.clone(), v.clone()));
        }

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?.contiguous()?;

        let in_dtype = q.dtype();
        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let scores = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
        let scores = if t > 1 {
            let mask = causal_mask(t, offset, x.device())?;
            scores.broadcast_add(&mask)?
        } else {
            scores
        };
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(in_dtype)?;

        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, t, self.num_heads * self.head_dim))?;
        self.o_proj.forward_t(&out, train)
    }
}

#[derive(Debug)]
struct Mlp {
    gate_proj: AdaptedLinear,
    up_proj: AdaptedLinear,
    down_proj: AdaptedLinear,
}

impl Mlp {
    fn load(builder: &mut Builder, prefix: &str, config: &DecoderConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        Ok(Self {
            gate_proj: builder.projection(prefix, "gate_proj", (hidden, inter), false)?,
            up_proj: builder.projection(prefix, "up_proj", (hidden, inter), false)?,
            down_proj: builder.projection(prefix, "down_proj", (inter, hidden), false)?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward_t(x, train)?)?;
        let up = self.up_proj.forward_t(x, train)?;
        self.down_proj.forward_t(&(gate * up)?, train)
    }
}

#[derive(Debug)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: Tensor,
    post_attention_layernorm: Tensor,
}

/// Decoder-only causal LM with LoRA adapters for fine-tuning
pub struct DecoderLoraModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: Tensor,
    lm_head: AdaptedLinear,
    rotary: RotaryEmbedding,
    config: DecoderConfig,
    architecture: ModelArchitecture,
    lora_config: LoraConfig,
    var_map: VarMap,
    base_model: String,
    num_lora_layers: usize,
    device: Device,
    dtype: DType,
}

impl DecoderLoraModel {
    /// Load base weights from `model_path` and attach fresh adapters
    pub fn from_model_path(
        model_path: &ModelPath,
        lora_config: &LoraConfig,
        quant: &QuantizationConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        model_path.validate()?;

        let config = DecoderConfig::from_file(&model_path.config_file)?;
        let weight_refs: Vec<&Path> = model_path.weights_files.iter().map(|p| p.as_path()).collect();

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&weight_refs, dtype, device)
                .context("Failed to load model weights")?
        };

        Self::from_var_builder(config, vb, lora_config, quant, &model_path.model_id, device)
    }

    /// Load base weights and a saved adapter directory
    pub fn with_adapter(
        model_path: &ModelPath,
        adapter_dir: &Path,
        quant: &QuantizationConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let adapter_config = AdapterConfig::load(adapter_dir)?;
        let mut model = Self::from_model_path(
            model_path,
            &adapter_config.lora_config(),
            quant,
            dtype,
            device,
        )?;
        model.load_adapter(adapter_dir)?;
        Ok(model)
    }

    /// Build the model from any weight source
    pub fn from_var_builder(
        config: DecoderConfig,
        vb: VarBuilder,
        lora_config: &LoraConfig,
        quant: &QuantizationConfig,
        base_model: &str,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        lora_config.validate()?;
        let architecture = config.architecture()?;
        if !architecture.supports_lora() {
            anyhow::bail!("LoRA fine-tuning does not support {} checkpoints", architecture);
        }
        quant.warn_unsupported();

        tracing::debug!(
            "Loading {} with LoRA: hidden={}, layers={}, vocab={}, lora_rank={}, quantized={}",
            architecture,
            config.hidden_size,
            config.num_hidden_layers,
            config.vocab_size,
            lora_config.rank,
            quant.enabled
        );

        let dtype = vb.dtype();
        let var_map = VarMap::new();
        let lora_vb = VarBuilder::from_varmap(&var_map, DType::F32, device).pp(PEFT_PREFIX);

        let embed_weight = vb
            .get((config.vocab_size, config.hidden_size), "model.embed_tokens.weight")
            .context("Failed to load embed_tokens")?;
        let embed_tokens = Embedding::new(embed_weight.clone(), config.hidden_size);

        let mut builder = Builder {
            base: vb.clone(),
            lora: lora_vb,
            lora_config,
            quant,
            num_lora_layers: 0,
        };

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let prefix = format!("model.layers.{}", i);
            let layer_vb = vb.pp(&prefix);
            layers.push(DecoderLayer {
                self_attn: Attention::load(&mut builder, &format!("{}.self_attn", prefix), &config)?,
                mlp: Mlp::load(&mut builder, &format!("{}.mlp", prefix), &config)?,
                input_layernorm: layer_vb.pp("input_layernorm").get(config.hidden_size, "weight")?,
                post_attention_layernorm: layer_vb
                    .pp("post_attention_layernorm")
                    .get(config.hidden_size, "weight")?,
            });
        }

        let norm = vb.pp("model.norm").get(config.hidden_size, "weight")?;

        // lm_head stays dense even when the base is quantized
        let lm_head_weight = if !config.tie_word_embeddings && vb.contains_tensor("lm_head.weight") {
            vb.get((config.vocab_size, config.hidden_size), "lm_head.weight")?
        } else {
            embed_weight
        };
        let lm_head = AdaptedLinear::frozen(FrozenWeight::Dense(lm_head_weight), None);

        let rotary = RotaryEmbedding::new(&config, dtype, device)?;
        let num_lora_layers = builder.num_lora_layers;

        if num_lora_layers == 0 {
            anyhow::bail!(
                "No projection matches LoRA target_modules {:?}",
                lora_config.target_modules
            );
        }

        let model = Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            config,
            architecture,
            lora_config: lora_config.clone(),
            var_map,
            base_model: base_model.to_string(),
            num_lora_layers,
            device: device.clone(),
            dtype,
        };

        tracing::debug!("Created decoder LoRA adapters: {}", model.lora_stats());
        Ok(model)
    }

    /// Logits `[batch, seq_len, vocab]` for `input_ids` placed at `offset`
    ///
    /// With a cache, keys and values of earlier calls are reused and the new
    /// ones appended.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        offset: usize,
        mut cache: Option<&mut DecoderCache>,
        train: bool,
    ) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        if offset + seq_len > self.config.max_position_embeddings {
            anyhow::bail!(
                "Sequence of {} tokens exceeds max_position_embeddings {}",
                offset + seq_len,
                self.config.max_position_embeddings
            );
        }

        let mut hidden = self.embed_tokens.forward(input_ids)?;
        let eps = self.config.rms_norm_eps;

        for (i, layer) in self.layers.iter().enumerate() {
            let slot = match cache.as_deref_mut() {
                Some(c) => c.kvs.get_mut(i),
                None => None,
            };
            let residual = hidden.clone();
            let normed = rms_norm(&hidden, &layer.input_layernorm, eps)?;
            let attn = layer
                .self_attn
                .forward(&normed, &self.rotary, offset, slot, train)?;
            let hidden_mid = (residual + attn)?;

            let normed = rms_norm(&hidden_mid, &layer.post_attention_layernorm, eps)?;
            let mlp = layer.mlp.forward(&normed, train)?;
            hidden = (hidden_mid + mlp)?;
        }

        let hidden = rms_norm(&hidden, &self.norm, eps)?;
        let logits = self.lm_head.forward_t(&hidden, train)?;
        Ok(logits.to_dtype(DType::F32)?)
    }

    /// Fold adapters into dense base weights for faster inference
    pub fn merge_adapters(&mut self) -> Result<()> {
        for layer in &mut self.layers {
            for proj in [
                &mut layer.self_attn.q_proj,
                &mut layer.self_attn.k_proj,
                &mut layer.self_attn.v_proj,
                &mut layer.self_attn.o_proj,
                &mut layer.mlp.gate_proj,
                &mut layer.mlp.up_proj,
                &mut layer.mlp.down_proj,
            ] {
                if proj.has_adapter() && !proj.is_quantized() {
                    proj.merge()?;
                }
            }
        }
        Ok(())
    }

    /// Fresh KV cache sized for this model
    pub fn new_cache(&self) -> DecoderCache {
        DecoderCache::new(self.layers.len())
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    pub fn lora_config(&self) -> &LoraConfig {
        &self.lora_config
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The variable map holding the adapter tensors
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn projections(&self) -> impl Iterator<Item = &AdaptedLinear> {
        self.layers.iter().flat_map(|l| {
            [
                &l.self_attn.q_proj,
                &l.self_attn.k_proj,
                &l.self_attn.v_proj,
                &l.self_attn.o_proj,
                &l.mlp.gate_proj,
                &l.mlp.up_proj,
                &l.mlp.down_proj,
            ]
        })
    }
}

impl CausalLanguageModel for DecoderLoraModel {
    fn forward_train(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
        self.forward(input_ids, 0, None, train)
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl LoraModel for DecoderLoraModel {
    fn lora_stats(&self) -> LoraStats {
        let hidden = self.config.hidden_size;
        let norms = (2 * self.layers.len() + 1) * hidden;
        let embed = self.config.vocab_size * hidden;
        let lm_head = if self.config.tie_word_embeddings {
            0
        } else {
            self.lm_head.num_total_params()
        };
        let projections: usize = self.projections().map(|p| p.num_total_params()).sum();
        let trainable: usize = self.projections().map(|p| p.num_trainable_params()).sum();

        LoraStats::new(
            embed + norms + lm_head + projections,
            trainable,
            self.num_lora_layers,
        )
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.var_map.all_vars()
    }

    fn save_adapter(&self, dir: &Path) -> Result<()> {
        let config = AdapterConfig::from_lora(&self.lora_config, Some(&self.base_model));
        lora::save_adapter(dir, &self.var_map, &config)
    }

    fn load_adapter(&mut self, dir: &Path) -> Result<()> {
        lora::load_adapter_weights(dir, &mut self.var_map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::models::test_utils::{tiny_model_path, TINY_LAYERS};

    fn load_tiny(lora: &LoraConfig, quant: &QuantizationConfig) -> (tempfile::TempDir, DecoderLoraModel) {
        let (dir, path) = tiny_model_path();
        let model =
            DecoderLoraModel::from_model_path(&path, lora, quant, DType::F32, &Device::Cpu).unwrap();
        (dir, model)
    }

    #[test]
    fn test_forward_shape_and_param_count() {
        let (_dir, model) = load_tiny(&LoraConfig::default(), &QuantizationConfig::default());
        let ids = Tensor::new(&[[1u32, 3, 4, 5], [1, 6, 7, 2]], &Device::Cpu).unwrap();
        let logits = model.forward_train(&ids, false).unwrap();
        assert_eq!(logits.dims(), &[2, 4, model.vocab_size()]);

        let stats = model.lora_stats();
        assert_eq!(stats.num_lora_layers, 2 * TINY_LAYERS);
        // q_proj: A (8 x 64) + B (64 x 8), v_proj: A (8 x 64) + B (32 x 8)
        assert_eq!(stats.trainable_params, TINY_LAYERS * (8 * 64 + 64 * 8 + 8 * 64 + 32 * 8));
        assert_eq!(model.trainable_vars().len(), 4 * TINY_LAYERS);
    }

    #[test]
    fn test_kv_cache_matches_full_forward() {
        let (_dir, model) = load_tiny(&LoraConfig::default(), &QuantizationConfig::default());
        let ids = Tensor::new(&[[1u32, 3, 4, 5, 6]], &Device::Cpu).unwrap();
        let full = model.forward(&ids, 0, None, false).unwrap();

        let mut cache = model.new_cache();
        let prefix = ids.narrow(1, 0, 4).unwrap();
        model.forward(&prefix, 0, Some(&mut cache), false).unwrap();
        assert_eq!(cache.seq_len(), 4);
        let last = ids.narrow(1, 4, 1).unwrap();
        let step = model.forward(&last, 4, Some(&mut cache), false).unwrap();

        let expected = full.narrow(1, 4, 1).unwrap();
        let diff = (step - expected)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "cache mismatch {}", diff);
    }

    #[test]
    fn test_causality() {
        let (_dir, model) = load_tiny(&LoraConfig::default(), &QuantizationConfig::default());
        let a = Tensor::new(&[[1u32, 3, 4, 5]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[1u32, 3, 4, 9]], &Device::Cpu).unwrap();
        let la = model.forward_train(&a, false).unwrap().narrow(1, 0, 3).unwrap();
        let lb = model.forward_train(&b, false).unwrap().narrow(1, 0, 3).unwrap();
        let diff = (la - lb).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_quantized_base_forward() {
        let (_dir, model) = load_tiny(&LoraConfig::default(), &QuantizationConfig::four_bit());
        assert!(model.layers[0].self_attn.q_proj.is_quantized());
        let ids = Tensor::new(&[[1u32, 3, 4]], &Device::Cpu).unwrap();
        let logits = model.forward_train(&ids, true).unwrap();
        assert_eq!(logits.dims(), &[1, 3, model.vocab_size()]);
    }

    #[test]
    fn test_gradients_reach_adapters_only() {
        let (_dir, model) = load_tiny(&LoraConfig::default().with_dropout(0.0), &QuantizationConfig::default());
        let ids = Tensor::new(&[[1u32, 3, 4, 5]], &Device::Cpu).unwrap();
        let logits = model.forward_train(&ids, true).unwrap();
        let loss = logits.sqr().unwrap().mean_all().unwrap();
        let grads = loss.backward().unwrap();

        let with_grad = model
            .trainable_vars()
            .iter()
            .filter(|v| grads.get(v.as_tensor()).is_some())
            .count();
        assert!(with_grad >= 2 * TINY_LAYERS);
    }

    #[test]
    fn test_adapter_round_trip_and_merge() {
        let (dir, path) = tiny_model_path();
        let lora = LoraConfig::default().with_dropout(0.0);
        let model = DecoderLoraModel::from_model_path(
            &path,
            &lora,
            &QuantizationConfig::default(),
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        for var in model.trainable_vars() {
            let noise = Tensor::randn(0f32, 0.02, var.shape(), &Device::Cpu).unwrap();
            var.set(&noise).unwrap();
        }

        let adapter_dir = dir.path().join("adapter");
        model.save_adapter(&adapter_dir).unwrap();
        assert!(adapter_dir.join(lora::ADAPTER_WEIGHTS_FILE).exists());
        {
            let saved = candle_core::safetensors::load(
                adapter_dir.join(lora::ADAPTER_WEIGHTS_FILE),
                &Device::Cpu,
            )
            .unwrap();
            assert!(saved.contains_key("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight"));
            assert!(saved.contains_key("base_model.model.model.layers.1.self_attn.v_proj.lora_B.weight"));
        }

        let mut restored = DecoderLoraModel::with_adapter(
            &path,
            &adapter_dir,
            &QuantizationConfig::default(),
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();

        let ids = Tensor::new(&[[1u32, 3, 4, 5]], &Device::Cpu).unwrap();
        let expected = model.forward_train(&ids, false).unwrap();
        let got = restored.forward_train(&ids, false).unwrap();
        restored.merge_adapters().unwrap();
        let merged = restored.forward_train(&ids, false).unwrap();

        for other in [got, merged] {
            let diff = (&expected - other)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(diff < 1e-4, "adapter mismatch {}", diff);
        }
    }

    #[test]
    fn test_unmatched_targets_rejected() {
        let (_dir, path) = tiny_model_path();
        let lora = LoraConfig::default().with_target_modules(vec!["query".to_string()]);
        let result = DecoderLoraModel::from_model_path(
            &path,
            &lora,
            &QuantizationConfig::default(),
            DType::F32,
            &Device::Cpu,
        );
        assert!(result.is_err());
    }
}
