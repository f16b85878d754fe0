//! Optimizers and learning-rate schedules for adapter training
//!
//! Only the LoRA variables are handed to the optimizer; the frozen base never
//! appears in its parameter list.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::optim::{Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

/// Optimizer names accepted in training configs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    AdamW,
    PagedAdamW,
}

impl std::str::FromStr for OptimizerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "adamw" | "adamw_torch" | "adamw_hf" | "adamw_32bit" => Ok(Self::AdamW),
            "paged_adamw_32bit" | "paged_adamw_8bit" | "paged_adamw" => Ok(Self::PagedAdamW),
            other => anyhow::bail!("Unsupported optimizer: {}", other),
        }
    }
}

/// AdamW optimizer configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    /// Learning rate
    pub lr: f64,
    /// Beta1 (first moment decay)
    pub beta1: f64,
    /// Beta2 (second moment decay)
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 2e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.001,
        }
    }
}

/// AdamW optimizer wrapper
pub struct AdamW {
    inner: candle_nn::optim::AdamW,
    vars: Vec<Var>,
    config: AdamWConfig,
    step_count: usize,
}

impl AdamW {
    /// Create a new AdamW optimizer over `vars`
    pub fn new(vars: Vec<Var>, config: AdamWConfig) -> Result<Self> {
        if vars.is_empty() {
            anyhow::bail!("Optimizer has no trainable parameters");
        }

        let params = ParamsAdamW {
            lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
        };

        let inner = candle_nn::optim::AdamW::new(vars.clone(), params)?;

        Ok(Self {
            inner,
            vars,
            config,
            step_count: 0,
        })
    }

    /// Build from a config name such as `paged_adamw_32bit`
    pub fn from_name(name: &str, vars: Vec<Var>, config: AdamWConfig) -> Result<Self> {
        if name.parse::<OptimizerKind>()? == OptimizerKind::PagedAdamW {
            tracing::info!("{}: paged optimizer state is not applicable, using AdamW", name);
        }
        Self::new(vars, config)
    }

    /// Perform an optimization step
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.inner.step(grads)?;
        self.step_count += 1;
        Ok(())
    }

    /// Clip gradients to `max_norm` (global L2) then step
    ///
    /// Returns the norm before clipping. A non-positive `max_norm` disables
    /// clipping.
    pub fn step_with_clipping(&mut self, grads: &mut GradStore, max_norm: f64) -> Result<f64> {
        let norm = clip_grad_norm(grads, &self.vars, max_norm)?;
        self.step(grads)?;
        Ok(norm)
    }

    /// Get current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    /// Set learning rate
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
        self.inner.set_learning_rate(lr);
    }

    /// Get step count
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }
}

/// Global L2 norm of the gradients of `vars`
pub fn compute_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total_norm_sq: f64 = 0.0;

    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let grad_norm_sq = grad
                .to_dtype(candle_core::DType::F32)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f32>()?;
            total_norm_sq += grad_norm_sq as f64;
        }
    }

    Ok(total_norm_sq.sqrt())
}

/// Rescale gradients in place so their global norm is at most `max_norm`
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let total_norm = compute_grad_norm(grads, vars)?;
    if max_norm <= 0.0 || total_norm <= max_norm {
        return Ok(total_norm);
    }

    let clip_coef = max_norm / (total_norm + 1e-6);
    tracing::debug!(
        "Clipping gradient norm {:.4} to {:.4} (coef {:.4})",
        total_norm,
        max_norm,
        clip_coef
    );

    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let scaled = (grad * clip_coef)?;
            grads.insert(var.as_tensor(), scaled);
        }
    }

    Ok(total_norm)
}

/// Add the gradients of `vars` from `update` into `acc`
pub fn accumulate_grads(acc: &mut GradStore, update: &GradStore, vars: &[Var]) -> Result<()> {
    for var in vars {
        let Some(new) = update.get(var.as_tensor()) else {
            continue;
        };
        let summed = match acc.get(var.as_tensor()) {
            Some(old) => (old + new)?,
            None => new.clone(),
        };
        acc.insert(var.as_tensor(), summed);
    }
    Ok(())
}

/// Learning-rate schedule shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    /// Fixed rate; warmup is ignored
    #[default]
    Constant,
    ConstantWithWarmup,
    Linear,
    Cosine,
}

impl std::str::FromStr for SchedulerType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "constant_with_warmup" => Ok(Self::ConstantWithWarmup),
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            other => anyhow::bail!("Unsupported lr scheduler: {}", other),
        }
    }
}

/// Learning rate scheduler
///
/// `get_lr` is the rate for the upcoming optimizer step; call `step` after
/// each optimizer step.
pub struct LearningRateScheduler {
    kind: SchedulerType,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LearningRateScheduler {
    pub fn new(kind: SchedulerType, base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Warmup length for a ratio of the total steps, rounded up
    pub fn warmup_from_ratio(total_steps: usize, ratio: f64) -> usize {
        (total_steps as f64 * ratio).ceil() as usize
    }

    fn warmup_factor(&self) -> Option<f64> {
        (self.current_step < self.warmup_steps)
            .then(|| self.current_step as f64 / self.warmup_steps.max(1) as f64)
    }

    fn decay_progress(&self) -> f64 {
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        (self.current_step.saturating_sub(self.warmup_steps) as f64 / span as f64).min(1.0)
    }

    /// Get the learning rate for the current step
    pub fn get_lr(&self) -> f64 {
        let factor = match self.kind {
            SchedulerType::Constant => 1.0,
            SchedulerType::ConstantWithWarmup => self.warmup_factor().unwrap_or(1.0),
            SchedulerType::Linear => self
                .warmup_factor()
                .unwrap_or_else(|| (1.0 - self.decay_progress()).max(0.0)),
            SchedulerType::Cosine => self.warmup_factor().unwrap_or_else(|| {
                0.5 * (1.0 + (std::f64::consts::PI * self.decay_progress()).cos())
            }),
        };
        self.base_lr * factor
    }

    /// Step the scheduler and return the new learning rate
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.get_lr()
    }

    /// Reset the scheduler
    pub fn reset(&mut self) {
        self.current_step = 0;
    }

    /// Get current step
    pub fn current_step(&self) -> usize {
        self.current_step
    }
}
