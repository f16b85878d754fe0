//! Causal language-modeling loss

use anyhow::Result;
use candle_core::{DType, Tensor, D};

/// Next-token cross-entropy averaged over non-padding targets
///
/// `logits` is `[batch, seq_len, vocab]`, `input_ids` and `attention_mask`
/// are `[batch, seq_len]`. Position `t` predicts token `t + 1`; targets whose
/// mask is zero are ignored.
pub fn causal_lm_loss(logits: &Tensor, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    if seq_len < 2 {
        anyhow::bail!("Need at least two tokens per sequence to compute a causal loss");
    }
    if input_ids.dims2()? != (batch, seq_len) {
        anyhow::bail!(
            "input_ids shape {:?} does not match logits {:?}",
            input_ids.shape(),
            logits.shape()
        );
    }

    let logits = logits.narrow(1, 0, seq_len - 1)?.to_dtype(DType::F32)?;
    let targets = input_ids
        .narrow(1, 1, seq_len - 1)?
        .to_dtype(DType::U32)?
        .contiguous()?;
    let mask = attention_mask
        .narrow(1, 1, seq_len - 1)?
        .to_dtype(DType::F32)?;

    let num_targets = mask.sum_all()?.to_scalar::<f32>()?;
    if num_targets <= 0.0 {
        anyhow::bail!("Batch has no target tokens after masking");
    }

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let target_log_probs = log_probs
        .gather(&targets.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;

    tracing::trace!(batch, seq_len, vocab, num_targets, "causal loss");

    let nll = (target_log_probs * mask)?.sum_all()?.neg()?;
    Ok((nll / num_targets as f64)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 4, 10), DType::F32, &device).unwrap();
        let ids = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 8]], &device).unwrap();
        let mask = Tensor::ones((2, 4), DType::F32, &device).unwrap();

        let loss = causal_lm_loss(&logits, &ids, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - (10f32).ln()).abs() < 1e-5);
    }

    #[test]
    fn test_padding_is_ignored() {
        let device = Device::Cpu;
        // Confident correct prediction for the single real target, garbage elsewhere
        let mut data = vec![0f32; 3 * 4];
        data[2] = 50.0; // position 0 predicts token 2
        data[4 + 1] = 50.0; // position 1 predicts token 1 but that target is padding
        let logits = Tensor::from_vec(data, (1, 3, 4), &device).unwrap();
        let ids = Tensor::new(&[[0u32, 2, 3]], &device).unwrap();
        let mask = Tensor::new(&[[1f32, 1.0, 0.0]], &device).unwrap();

        let loss = causal_lm_loss(&logits, &ids, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss < 1e-3, "loss {}", loss);
    }

    #[test]
    fn test_all_padding_is_an_error() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let ids = Tensor::new(&[[0u32, 2, 3]], &device).unwrap();
        let mask = Tensor::new(&[[1f32, 0.0, 0.0]], &device).unwrap();
        assert!(causal_lm_loss(&logits, &ids, &mask).is_err());
    }

    #[test]
    fn test_loss_is_differentiable() {
        let device = Device::Cpu;
        let var = candle_core::Var::zeros((1, 3, 5), DType::F32, &device).unwrap();
        let ids = Tensor::new(&[[0u32, 1, 2]], &device).unwrap();
        let mask = Tensor::ones((1, 3), DType::F32, &device).unwrap();

        let loss = causal_lm_loss(var.as_tensor(), &ids, &mask).unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(var.as_tensor()).is_some());
    }
}
