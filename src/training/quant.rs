//! Base weight quantization for QLoRA
//!
//! The frozen projection weights of the base model are stored as candle
//! quantized tensors and dequantized to the compute dtype for each matmul.
//! Gradients never flow into them; only the LoRA adapters train.

use anyhow::{Context, Result};
use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

/// Quantization formats usable for the frozen base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    /// 4-bit, one scale per 32-value block
    #[default]
    #[serde(alias = "4bit")]
    Q4_0,
    /// 4-bit, scale and min per block
    Q4_1,
    /// 8-bit, one scale per block
    #[serde(alias = "8bit")]
    Q8_0,
    /// Normal-float 4-bit; no candle kernel, stored as Q4_0
    Nf4,
    /// Plain 4-bit float; no candle kernel, stored as Q4_0
    Fp4,
}

impl QuantType {
    /// Candle storage format for this quant type
    pub fn ggml_dtype(&self) -> GgmlDType {
        match self {
            Self::Q4_0 | Self::Nf4 | Self::Fp4 => GgmlDType::Q4_0,
            Self::Q4_1 => GgmlDType::Q4_1,
            Self::Q8_0 => GgmlDType::Q8_0,
        }
    }
}

impl std::str::FromStr for QuantType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "q4_0" | "q4" | "4bit" => Ok(Self::Q4_0),
            "q4_1" => Ok(Self::Q4_1),
            "q8_0" | "q8" | "8bit" => Ok(Self::Q8_0),
            "nf4" => Ok(Self::Nf4),
            "fp4" => Ok(Self::Fp4),
            other => anyhow::bail!("Unknown quantization type: {}", other),
        }
    }
}

impl std::fmt::Display for QuantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Q4_0 => "q4_0",
            Self::Q4_1 => "q4_1",
            Self::Q8_0 => "q8_0",
            Self::Nf4 => "nf4",
            Self::Fp4 => "fp4",
        };
        write!(f, "{}", name)
    }
}

/// Quantization settings for the frozen base model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    /// Quantize the base model's projection weights
    pub enabled: bool,
    /// Storage format
    pub quant_type: QuantType,
    /// Dtype weights are dequantized to for each matmul ("f32", "f16", "bf16")
    pub compute_dtype: String,
    /// Second-level quantization of the scales
    pub double_quant: bool,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            quant_type: QuantType::Q4_0,
            compute_dtype: "f32".to_string(),
            double_quant: false,
        }
    }
}

impl QuantizationConfig {
    /// 4-bit base as used for QLoRA
    pub fn four_bit() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Parsed compute dtype
    pub fn compute_dtype(&self) -> Result<DType> {
        parse_dtype(&self.compute_dtype)
    }

    /// Log settings that have no candle counterpart
    pub fn warn_unsupported(&self) {
        if !self.enabled {
            return;
        }
        if matches!(self.quant_type, QuantType::Nf4 | QuantType::Fp4) {
            tracing::warn!(
                "{} has no candle kernel; base weights are stored as {:?} instead",
                self.quant_type,
                self.quant_type.ggml_dtype()
            );
        }
        if self.double_quant {
            tracing::warn!("double quantization is not available in candle; ignoring");
        }
    }
}

/// Parse a dtype name as found in configs and `torch_dtype`
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.trim().to_lowercase().as_str() {
        "f32" | "float32" | "float" => Ok(DType::F32),
        "f16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => anyhow::bail!("Unsupported dtype: {}", other),
    }
}

/// A frozen base weight, either a plain tensor or a quantized one
#[derive(Debug)]
pub enum FrozenWeight {
    Dense(Tensor),
    Quantized {
        weight: QTensor,
        compute_dtype: DType,
        device: Device,
    },
}

impl FrozenWeight {
    /// Quantize `weight` when the layout allows it, otherwise keep it dense
    ///
    /// Rows of the weight are quantized block-wise, so the input dimension
    /// must be a multiple of the block size.
    pub fn quantize(weight: Tensor, config: &QuantizationConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self::Dense(weight));
        }

        let dtype = config.quant_type.ggml_dtype();
        let in_features = weight.dim(candle_core::D::Minus1)?;
        if in_features % dtype.block_size() != 0 {
            tracing::debug!(
                "Keeping weight {:?} dense: {} is not a multiple of block size {}",
                weight.shape(),
                in_features,
                dtype.block_size()
            );
            return Ok(Self::Dense(weight));
        }

        let device = weight.device().clone();
        let qweight = QTensor::quantize(&weight.to_dtype(DType::F32)?, dtype)
            .context("Failed to quantize base weight")?;

        Ok(Self::Quantized {
            weight: qweight,
            compute_dtype: config.compute_dtype()?,
            device,
        })
    }

    /// Weight as a dense tensor, detached from any graph
    pub fn dense(&self) -> Result<Tensor> {
        match self {
            Self::Dense(w) => Ok(w.clone()),
            Self::Quantized {
                weight,
                compute_dtype,
                device,
            } => Ok(weight.dequantize(device)?.to_dtype(*compute_dtype)?),
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized { .. })
    }

    /// Number of weight values
    pub fn elem_count(&self) -> usize {
        match self {
            Self::Dense(w) => w.elem_count(),
            Self::Quantized { weight, .. } => weight.shape().elem_count(),
        }
    }

    /// `(out_features, in_features)`
    pub fn dims2(&self) -> Result<(usize, usize)> {
        match self {
            Self::Dense(w) => Ok(w.dims2()?),
            Self::Quantized { weight, .. } => Ok(weight.shape().dims2()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quant_type_parsing() {
        assert_eq!("q4_0".parse::<QuantType>().unwrap(), QuantType::Q4_0);
        assert_eq!("NF4".parse::<QuantType>().unwrap(), QuantType::Nf4);
        assert_eq!("8bit".parse::<QuantType>().unwrap(), QuantType::Q8_0);
        assert!("int3".parse::<QuantType>().is_err());
        assert_eq!(QuantType::Nf4.ggml_dtype(), GgmlDType::Q4_0);
        assert_eq!(QuantType::Q8_0.ggml_dtype(), GgmlDType::Q8_0);
    }

    #[test]
    fn test_parse_dtype() {
        assert_eq!(parse_dtype("float16").unwrap(), DType::F16);
        assert_eq!(parse_dtype("bfloat16").unwrap(), DType::BF16);
        assert_eq!(parse_dtype("F32").unwrap(), DType::F32);
        assert!(parse_dtype("int8").is_err());
    }

    #[test]
    fn test_disabled_keeps_dense() {
        let w = Tensor::ones((4, 64), DType::F32, &Device::Cpu).unwrap();
        let frozen = FrozenWeight::quantize(w, &QuantizationConfig::default()).unwrap();
        assert!(!frozen.is_quantized());
    }

    #[test]
    fn test_unaligned_input_dim_stays_dense() {
        let w = Tensor::ones((4, 33), DType::F32, &Device::Cpu).unwrap();
        let frozen = FrozenWeight::quantize(w, &QuantizationConfig::four_bit()).unwrap();
        assert!(!frozen.is_quantized());
        assert_eq!(frozen.dims2().unwrap(), (4, 33));
    }

    #[test]
    fn test_quantize_dequantize_close() {
        let w = Tensor::randn(0f32, 1.0, (8, 64), &Device::Cpu).unwrap();
        let config = QuantizationConfig {
            enabled: true,
            quant_type: QuantType::Q8_0,
            ..Default::default()
        };
        let frozen = FrozenWeight::quantize(w.clone(), &config).unwrap();
        assert!(frozen.is_quantized());
        assert_eq!(frozen.dims2().unwrap(), (8, 64));

        let restored = frozen.dense().unwrap();
        let max_err = (restored - w)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(max_err < 0.05, "max error {}", max_err);
    }
}
