//! LoRA/QLoRA fine-tuning
//!
//! Parameter-efficient fine-tuning using Candle.
//!
//! # LoRA (Low-Rank Adaptation)
//!
//! LoRA reduces the number of trainable parameters by decomposing weight updates
//! into low-rank matrices:
//!
//! ```text
//! W' = W + BA * (alpha / rank)
//! ```
//!
//! Where:
//! - W is the frozen pretrained weight (optionally quantized, see [`crate::training::quant`])
//! - B ∈ ℝ^(out × rank) initialized to zeros
//! - A ∈ ℝ^(rank × in) initialized with Kaiming uniform
//! - alpha is a scaling factor
//!
//! Adapters are saved in the PEFT layout (`adapter_model.safetensors` and
//! `adapter_config.json`) so they load in other tooling.

use anyhow::{Context, Result};
use candle_core::{Module, Tensor};
use candle_nn::{Init, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::training::quant::FrozenWeight;

/// File holding adapter tensors
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
/// File holding adapter hyperparameters
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
/// Prefix PEFT puts in front of the wrapped model's parameter names
pub const PEFT_PREFIX: &str = "base_model.model";

/// LoRA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition
    #[serde(alias = "r")]
    pub rank: usize,
    /// Scaling numerator; effective scale is alpha / rank
    #[serde(alias = "lora_alpha")]
    pub alpha: f32,
    /// Dropout probability applied to the adapter input while training
    #[serde(alias = "lora_dropout")]
    pub dropout: f32,
    /// Projection names that receive adapters (e.g. `q_proj`, `v_proj`)
    pub target_modules: Vec<String>,
    /// Bias handling; only "none" is supported
    pub bias: String,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 8.0,
            dropout: 0.1,
            target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
            bias: "none".to_string(),
        }
    }
}

impl LoraConfig {
    /// Create a new LoRA config
    pub fn new(rank: usize, alpha: f32) -> Self {
        Self {
            rank,
            alpha,
            ..Default::default()
        }
    }

    /// Set dropout
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Set target modules
    pub fn with_target_modules(mut self, modules: Vec<String>) -> Self {
        self.target_modules = modules;
        self
    }

    /// Get the scaling factor
    pub fn scaling(&self) -> f32 {
        self.alpha / self.rank as f32
    }

    /// Whether a projection named `module` gets an adapter
    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|t| t == module || t == "all-linear")
    }

    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            anyhow::bail!("LoRA rank must be greater than 0");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("LoRA dropout must be in [0, 1), got {}", self.dropout);
        }
        if self.bias != "none" {
            anyhow::bail!("Unsupported LoRA bias mode '{}', only 'none' is supported", self.bias);
        }
        if self.target_modules.is_empty() {
            anyhow::bail!("LoRA target_modules must not be empty");
        }
        Ok(())
    }
}

/// Trainable low-rank pair attached to one projection
#[derive(Debug)]
struct LoraAdapter {
    /// Down projection: rank x in
    a: Tensor,
    /// Up projection: out x rank
    b: Tensor,
    scaling: f64,
    dropout: f32,
    rank: usize,
}

impl LoraAdapter {
    fn delta_weight(&self) -> Result<Tensor> {
        Ok((self.b.matmul(&self.a)? * self.scaling)?)
    }
}

/// Linear projection with a frozen base and an optional LoRA adapter
#[derive(Debug)]
pub struct AdaptedLinear {
    base: FrozenWeight,
    bias: Option<Tensor>,
    lora: Option<LoraAdapter>,
    merged: bool,
}

impl AdaptedLinear {
    /// Projection without an adapter
    pub fn frozen(base: FrozenWeight, bias: Option<Tensor>) -> Self {
        Self {
            base,
            bias,
            lora: None,
            merged: false,
        }
    }

    /// Projection with adapter variables created under `vb`
    ///
    /// `vb` should be backed by the [`VarMap`] that the optimizer sees;
    /// variables are named `lora_A.weight` and `lora_B.weight`.
    pub fn with_lora(
        base: FrozenWeight,
        bias: Option<Tensor>,
        config: &LoraConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (out_features, in_features) = base.dims2()?;

        let a = vb.pp("lora_A").get_with_hints(
            (config.rank, in_features),
            "weight",
            Init::Kaiming {
                dist: candle_nn::init::NormalOrUniform::Uniform,
                fan: candle_nn::init::FanInOut::FanIn,
                non_linearity: candle_nn::init::NonLinearity::Linear,
            },
        )?;
        let b = vb
            .pp("lora_B")
            .get_with_hints((out_features, config.rank), "weight", Init::Const(0.0))?;

        Ok(Self {
            base,
            bias,
            lora: Some(LoraAdapter {
                a,
                b,
                scaling: config.scaling() as f64,
                dropout: config.dropout,
                rank: config.rank,
            }),
            merged: false,
        })
    }

    /// Forward pass; dropout on the adapter path only when `train` is set
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let weight = self.base.dense()?;
        let weight = if weight.dtype() != x.dtype() {
            weight.to_dtype(x.dtype())?
        } else {
            weight
        };
        let bias = match &self.bias {
            Some(b) => Some(b.to_dtype(x.dtype())?),
            None => None,
        };
        let base_out = Linear::new(weight, bias).forward(x)?;

        let lora = match (&self.lora, self.merged) {
            (Some(lora), false) => lora,
            _ => return Ok(base_out),
        };

        let input = x.to_dtype(lora.a.dtype())?;
        let input = if train && lora.dropout > 0.0 {
            candle_nn::ops::dropout(&input, lora.dropout)?
        } else {
            input
        };
        // x @ A^T @ B^T * scaling
        let down = Linear::new(lora.a.clone(), None).forward(&input)?;
        let up = Linear::new(lora.b.clone(), None).forward(&down)?;
        let delta = (up * lora.scaling)?.to_dtype(base_out.dtype())?;

        Ok((base_out + delta)?)
    }

    /// Fold the adapter into the base weight for inference
    pub fn merge(&mut self) -> Result<()> {
        if self.merged {
            return Ok(());
        }
        let Some(lora) = &self.lora else {
            return Ok(());
        };
        let FrozenWeight::Dense(weight) = &self.base else {
            anyhow::bail!("Cannot merge a LoRA adapter into a quantized base weight");
        };

        let delta = lora.delta_weight()?.to_dtype(weight.dtype())?;
        self.base = FrozenWeight::Dense((weight + delta)?.detach());
        self.merged = true;
        Ok(())
    }

    pub fn has_adapter(&self) -> bool {
        self.lora.is_some()
    }

    pub fn is_quantized(&self) -> bool {
        self.base.is_quantized()
    }

    /// Get number of trainable parameters
    pub fn num_trainable_params(&self) -> usize {
        self.lora
            .as_ref()
            .map(|l| l.a.elem_count() + l.b.elem_count())
            .unwrap_or(0)
    }

    /// Get number of total parameters (including frozen)
    pub fn num_total_params(&self) -> usize {
        self.base.elem_count()
            + self.bias.as_ref().map(|b| b.elem_count()).unwrap_or(0)
            + self.num_trainable_params()
    }

    /// Adapter rank, if any
    pub fn rank(&self) -> Option<usize> {
        self.lora.as_ref().map(|l| l.rank)
    }
}

/// Statistics about LoRA parameters
#[derive(Debug, Clone)]
pub struct LoraStats {
    /// Total parameters in the model
    pub total_params: usize,
    /// Trainable parameters (LoRA only)
    pub trainable_params: usize,
    /// Percentage of trainable parameters
    pub trainable_percent: f64,
    /// Number of LoRA layers
    pub num_lora_layers: usize,
}

impl LoraStats {
    /// Create stats from counts
    pub fn new(total: usize, trainable: usize, num_layers: usize) -> Self {
        let trainable_percent = if total == 0 {
            0.0
        } else {
            trainable as f64 / total as f64 * 100.0
        };
        Self {
            total_params: total,
            trainable_params: trainable,
            trainable_percent,
            num_lora_layers: num_layers,
        }
    }
}

impl std::fmt::Display for LoraStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            group_thousands(self.trainable_params),
            group_thousands(self.total_params),
            self.trainable_percent
        )
    }
}

fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// `adapter_config.json` in the PEFT format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub peft_type: String,
    pub task_type: String,
    pub r: usize,
    pub lora_alpha: f32,
    pub lora_dropout: f32,
    pub bias: String,
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default)]
    pub inference_mode: bool,
    #[serde(default)]
    pub fan_in_fan_out: bool,
}

impl AdapterConfig {
    pub fn from_lora(config: &LoraConfig, base_model: Option<&str>) -> Self {
        Self {
            peft_type: "LORA".to_string(),
            task_type: "CAUSAL_LM".to_string(),
            r: config.rank,
            lora_alpha: config.alpha,
            lora_dropout: config.dropout,
            bias: config.bias.clone(),
            target_modules: config.target_modules.clone(),
            base_model_name_or_path: base_model.map(str::to_string),
            inference_mode: true,
            fan_in_fan_out: false,
        }
    }

    pub fn lora_config(&self) -> LoraConfig {
        LoraConfig {
            rank: self.r,
            alpha: self.lora_alpha,
            dropout: self.lora_dropout,
            target_modules: self.target_modules.clone(),
            bias: self.bias.clone(),
        }
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(ADAPTER_CONFIG_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read adapter config: {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse adapter config: {:?}", path))?;
        if config.peft_type.to_uppercase() != "LORA" {
            anyhow::bail!("Unsupported adapter type: {}", config.peft_type);
        }
        Ok(config)
    }

    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join(ADAPTER_CONFIG_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write adapter config: {:?}", path))?;
        Ok(())
    }
}

/// Write adapter weights and config to `dir`
///
/// `var_map` must hold only adapter variables, named with the PEFT prefix.
pub fn save_adapter(dir: impl AsRef<Path>, var_map: &VarMap, config: &AdapterConfig) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create adapter directory: {:?}", dir))?;

    var_map
        .save(dir.join(ADAPTER_WEIGHTS_FILE))
        .with_context(|| format!("Failed to save adapter weights to {:?}", dir))?;
    config.save(dir)?;

    tracing::info!("Saved LoRA adapter to {:?}", dir);
    Ok(())
}

/// Copy adapter weights from `dir` into the existing variables of `var_map`
pub fn load_adapter_weights(dir: impl AsRef<Path>, var_map: &mut VarMap) -> Result<()> {
    let path = dir.as_ref().join(ADAPTER_WEIGHTS_FILE);
    if !path.exists() {
        anyhow::bail!("Adapter weights not found: {:?}", path);
    }
    var_map
        .load(&path)
        .with_context(|| format!("Failed to load adapter weights from {:?}", path))?;
    tracing::info!("Loaded LoRA adapter weights from {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn adapted(config: &LoraConfig, var_map: &VarMap) -> AdaptedLinear {
        let device = Device::Cpu;
        let weight = Tensor::randn(0f32, 0.1, (6, 4), &device).unwrap();
        let vb = VarBuilder::from_varmap(var_map, DType::F32, &device);
        AdaptedLinear::with_lora(FrozenWeight::Dense(weight), None, config, vb.pp("proj")).unwrap()
    }

    #[test]
    fn test_lora_config_default() {
        let config = LoraConfig::default();
        assert_eq!(config.rank, 8);
        assert_eq!(config.alpha, 8.0);
        assert_eq!(config.scaling(), 1.0);
        assert!(config.targets("q_proj"));
        assert!(!config.targets("o_proj"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lora_config_custom() {
        let config = LoraConfig::new(16, 32.0)
            .with_dropout(0.05)
            .with_target_modules(vec!["q_proj".to_string(), "k_proj".to_string(), "v_proj".to_string()]);

        assert_eq!(config.rank, 16);
        assert_eq!(config.scaling(), 2.0);
        assert_eq!(config.dropout, 0.05);
        assert_eq!(config.target_modules.len(), 3);
    }

    #[test]
    fn test_lora_config_validation() {
        assert!(LoraConfig::new(0, 8.0).validate().is_err());
        let mut config = LoraConfig::default();
        config.bias = "all".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peft_key_aliases() {
        let config: LoraConfig =
            serde_json::from_str(r#"{"r": 4, "lora_alpha": 16, "lora_dropout": 0.0}"#).unwrap();
        assert_eq!(config.rank, 4);
        assert_eq!(config.scaling(), 4.0);
        assert_eq!(config.target_modules, vec!["q_proj", "v_proj"]);
    }

    #[test]
    fn test_zero_init_matches_base() {
        let var_map = VarMap::new();
        let layer = adapted(&LoraConfig::new(2, 4.0).with_dropout(0.0), &var_map);
        let x = Tensor::randn(0f32, 1.0, (2, 3, 4), &Device::Cpu).unwrap();

        let with_adapter = layer.forward_t(&x, false).unwrap();
        assert_eq!(with_adapter.dims(), &[2, 3, 6]);

        let base = layer.base.dense().unwrap();
        let expected = Linear::new(base, None).forward(&x).unwrap();
        let diff = (with_adapter - expected)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_merge_preserves_output() {
        let var_map = VarMap::new();
        let mut layer = adapted(&LoraConfig::new(2, 2.0).with_dropout(0.0), &var_map);
        // give B non-zero values so the delta matters
        for (name, var) in var_map.data().lock().unwrap().iter() {
            if name.contains("lora_B") {
                var.set(&Tensor::ones((6, 2), DType::F32, &Device::Cpu).unwrap()).unwrap();
            }
        }

        let x = Tensor::randn(0f32, 1.0, (1, 2, 4), &Device::Cpu).unwrap();
        let before = layer.forward_t(&x, false).unwrap();
        layer.merge().unwrap();
        let merged = layer.forward_t(&x, false).unwrap();
        // merging twice is a no-op
        layer.merge().unwrap();
        let after = layer.forward_t(&x, false).unwrap();

        for other in [merged, after] {
            let diff = (&before - other)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(diff < 1e-4);
        }
    }

    #[test]
    fn test_param_counts() {
        let var_map = VarMap::new();
        let layer = adapted(&LoraConfig::new(2, 2.0), &var_map);
        assert_eq!(layer.num_trainable_params(), 2 * 4 + 6 * 2);
        assert_eq!(layer.num_total_params(), 24 + 20);
        assert_eq!(var_map.all_vars().len(), 2);
    }

    #[test]
    fn test_lora_stats_display() {
        let stats = LoraStats::new(6_742_609_920, 4_194_304, 64);
        assert_eq!(
            stats.to_string(),
            "trainable params: 4,194,304 || all params: 6,742,609,920 || trainable%: 0.0622"
        );
        assert_eq!(LoraStats::new(0, 0, 0).trainable_percent, 0.0);
    }

    #[test]
    fn test_adapter_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoraConfig::new(2, 2.0);

        let var_map = VarMap::new();
        let _layer = adapted(&config, &var_map);
        let adapter_config = AdapterConfig::from_lora(&config, Some("tiny-llama"));
        save_adapter(dir.path(), &var_map, &adapter_config).unwrap();

        let loaded = AdapterConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.r, 2);
        assert_eq!(loaded.task_type, "CAUSAL_LM");
        assert_eq!(loaded.base_model_name_or_path.as_deref(), Some("tiny-llama"));

        let mut fresh = VarMap::new();
        let _other = adapted(&loaded.lora_config(), &fresh);
        load_adapter_weights(dir.path(), &mut fresh).unwrap();

        let original = var_map.data().lock().unwrap();
        let restored = fresh.data().lock().unwrap();
        let a = original.get("proj.lora_A.weight").unwrap().as_tensor();
        let b = restored.get("proj.lora_A.weight").unwrap().as_tensor();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(diff, 0.0);
    }
}
