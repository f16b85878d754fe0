//! Supervised fine-tuning loop for causal language models
//!
//! Provides a high-level API for training LoRA adapters with:
//! - Gradient accumulation
//! - Gradient clipping
//! - Learning rate scheduling
//! - Periodic checkpoints and loss logging

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

use super::checkpoint::{CheckpointManager, LogEntry, TrainerState};
use super::dataset::{TextDataset, TextExample};
use super::loss::causal_lm_loss;
use super::models::{LoraModel, TokenizerWrapper};
use super::optimizer::{accumulate_grads, AdamW, AdamWConfig, LearningRateScheduler, SchedulerType};

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Output directory for checkpoints
    pub output_dir: PathBuf,
    /// Number of training epochs
    pub num_train_epochs: usize,
    /// Micro-batch size
    pub per_device_train_batch_size: usize,
    /// Micro-batches per optimizer step
    pub gradient_accumulation_steps: usize,
    /// Optimizer name (`adamw_torch`, `paged_adamw_32bit`, ...)
    pub optim: String,
    /// Save checkpoint every N optimizer steps (0 to disable)
    pub save_steps: usize,
    /// Log every N optimizer steps
    pub logging_steps: usize,
    /// Base learning rate
    pub learning_rate: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Load the base model in f16
    pub fp16: bool,
    /// Load the base model in bf16
    pub bf16: bool,
    /// Maximum gradient norm for clipping
    pub max_grad_norm: f64,
    /// Total optimizer steps; overrides epochs when positive
    pub max_steps: i64,
    /// Warmup steps (fraction of total)
    pub warmup_ratio: f64,
    /// Batch examples of similar token length together
    pub group_by_length: bool,
    pub lr_scheduler_type: SchedulerType,
    /// Maximum sequence length
    pub max_seq_length: usize,
    /// Seed for batch ordering
    pub seed: u64,
    /// Keep at most this many checkpoints
    pub save_total_limit: Option<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./results"),
            num_train_epochs: 1,
            per_device_train_batch_size: 4,
            gradient_accumulation_steps: 1,
            optim: "adamw_torch".to_string(),
            save_steps: 500,
            logging_steps: 50,
            learning_rate: 2e-4,
            weight_decay: 0.0,
            fp16: false,
            bf16: false,
            max_grad_norm: 1.0,
            max_steps: -1,
            warmup_ratio: 0.0,
            group_by_length: false,
            lr_scheduler_type: SchedulerType::Linear,
            max_seq_length: 512,
            seed: 42,
            save_total_limit: None,
        }
    }
}

impl TrainingConfig {
    /// Optimizer steps per epoch for `num_examples` examples
    pub fn steps_per_epoch(&self, num_examples: usize) -> usize {
        let batches = num_examples.div_ceil(self.per_device_train_batch_size.max(1));
        batches.div_ceil(self.gradient_accumulation_steps.max(1)).max(1)
    }

    /// Total optimizer steps for `num_examples` examples
    pub fn total_steps(&self, num_examples: usize) -> usize {
        if self.max_steps > 0 {
            self.max_steps as usize
        } else {
            self.steps_per_epoch(num_examples) * self.num_train_epochs
        }
    }
}

/// Training metrics
#[derive(Debug, Clone, Default)]
pub struct TrainingMetrics {
    /// Loss averaged since the previous log
    pub train_loss: f64,
    /// Number of optimizer steps taken
    pub global_step: usize,
    /// Fractional epoch
    pub epoch: f64,
    /// Samples per second
    pub samples_per_second: f64,
    /// Current learning rate
    pub learning_rate: f64,
    /// Gradient norm before clipping at the last step
    pub grad_norm: f64,
}

impl std::fmt::Display for TrainingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Step {} | Epoch {:.2} | Loss: {:.4} | LR: {:.2e} | Grad norm: {:.3} | {:.1} samples/s",
            self.global_step,
            self.epoch,
            self.train_loss,
            self.learning_rate,
            self.grad_norm,
            self.samples_per_second
        )
    }
}

/// Training result
#[derive(Debug)]
pub struct TrainingResult {
    /// Final metrics
    pub metrics: TrainingMetrics,
    /// Most recent checkpoint directory (if any was saved)
    pub checkpoint_path: Option<PathBuf>,
    /// Loss of every optimizer step
    pub history: Vec<f64>,
    /// Logged entries, as written to `trainer_state.json`
    pub log_history: Vec<LogEntry>,
    /// Mean loss over the whole run
    pub train_loss: f64,
    /// Wall time in seconds
    pub train_runtime: f64,
}

/// Progress callback for training
pub type ProgressCallback = Box<dyn Fn(&TrainingMetrics) + Send>;

/// Gradients and losses collected between optimizer steps
#[derive(Default)]
struct Accumulation {
    grads: Option<GradStore>,
    loss_sum: f64,
    micro_batches: usize,
    samples: usize,
}

/// Trainer for fine-tuning causal LM adapters
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
}

impl Trainer {
    /// Create a new trainer
    pub fn new(config: TrainingConfig, device: Device) -> Self {
        Self { config, device }
    }

    /// Get the device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Get the config
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Create optimizer over the model's adapter variables
    pub fn create_optimizer<M: LoraModel + ?Sized>(&self, model: &M) -> Result<AdamW> {
        let config = AdamWConfig {
            lr: self.config.learning_rate,
            weight_decay: self.config.weight_decay,
            ..Default::default()
        };
        AdamW::from_name(&self.config.optim, model.trainable_vars(), config)
    }

    /// Create learning rate scheduler
    pub fn create_scheduler(&self, total_steps: usize) -> LearningRateScheduler {
        let warmup_steps = LearningRateScheduler::warmup_from_ratio(total_steps, self.config.warmup_ratio);
        LearningRateScheduler::new(
            self.config.lr_scheduler_type,
            self.config.learning_rate,
            warmup_steps,
            total_steps,
        )
    }

    /// Train the model's adapters on the dataset
    pub fn train<M: LoraModel + ?Sized>(
        &self,
        model: &M,
        tokenizer: &TokenizerWrapper,
        dataset: &TextDataset,
        progress_callback: Option<ProgressCallback>,
    ) -> Result<TrainingResult> {
        if dataset.is_empty() {
            anyhow::bail!("Training dataset is empty");
        }

        let mut tokenizer = tokenizer.clone().with_max_length(self.config.max_seq_length);
        if tokenizer.pad_token_id().is_none() {
            tokenizer = tokenizer.with_pad_token_from_eos()?;
        }

        let batch_size = self.config.per_device_train_batch_size.max(1);
        let grad_accum = self.config.gradient_accumulation_steps.max(1);
        let steps_per_epoch = self.config.steps_per_epoch(dataset.len());
        let total_steps = self.config.total_steps(dataset.len());
        let num_epochs = if self.config.max_steps > 0 {
            total_steps.div_ceil(steps_per_epoch)
        } else {
            self.config.num_train_epochs
        };

        tracing::info!("Starting training:");
        tracing::info!("  Dataset size: {}", dataset.len());
        tracing::info!("  Batch size: {}", batch_size);
        tracing::info!("  Gradient accumulation steps: {}", grad_accum);
        tracing::info!("  Effective batch size: {}", batch_size * grad_accum);
        tracing::info!("  Epochs: {}", num_epochs);
        tracing::info!("  Total optimization steps: {}", total_steps);
        tracing::info!("  Learning rate: {} ({:?})", self.config.learning_rate, self.config.lr_scheduler_type);
        tracing::info!("  Max gradient norm: {}", self.config.max_grad_norm);
        tracing::info!("  Trainable: {}", model.lora_stats());

        let mut optimizer = self.create_optimizer(model)?;
        let mut scheduler = self.create_scheduler(total_steps);
        optimizer.set_learning_rate(scheduler.get_lr());

        let checkpoints = CheckpointManager::new(&self.config.output_dir, self.config.save_total_limit);
        std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!("Failed to create output directory {:?}", self.config.output_dir)
        })?;

        let lengths = if self.config.group_by_length {
            let texts: Vec<String> = dataset.iter().map(|ex| ex.text.clone()).collect();
            Some(tokenizer.token_lengths(&texts)?)
        } else {
            None
        };

        let mut metrics = TrainingMetrics::default();
        let mut history = Vec::new();
        let mut log_history = Vec::new();
        let mut checkpoint_path = None;
        let mut loss_since_log = 0.0;
        let mut steps_since_log = 0usize;
        let run_start = Instant::now();
        let mut step_start = Instant::now();

        'epochs: for epoch in 0..num_epochs {
            let epoch_start = Instant::now();
            let seed = Some(self.config.seed + epoch as u64);
            let batches: Vec<Vec<&TextExample>> = match &lengths {
                Some(lengths) => dataset.grouped_batches(batch_size, lengths, seed)?.collect(),
                None => dataset.shuffled_batches(batch_size, seed).collect(),
            };
            let num_batches = batches.len();
            let mut acc = Accumulation::default();

            for (batch_idx, batch) in batches.into_iter().enumerate() {
                let texts: Vec<String> = batch.iter().map(|ex| ex.text.clone()).collect();
                let encoded = tokenizer.encode_batch(&texts, true)?;
                if encoded.seq_len < 2 {
                    tracing::warn!("Skipping batch {} of epoch {}: sequences too short", batch_idx, epoch + 1);
                } else {
                    let (input_ids, attention_mask) = encoded.to_tensors(&self.device)?;
                    let logits = model.forward_train(&input_ids, true)?;
                    let loss = causal_lm_loss(&logits, &input_ids, &attention_mask)?;
                    let loss_value = loss.to_scalar::<f32>()? as f64;
                    if !loss_value.is_finite() {
                        anyhow::bail!("Loss became {} at step {}", loss_value, metrics.global_step);
                    }

                    let scaled_loss = (&loss / grad_accum as f64)?;
                    let grads = scaled_loss.backward()?;
                    match acc.grads.as_mut() {
                        Some(store) => accumulate_grads(store, &grads, optimizer.vars())?,
                        None => acc.grads = Some(grads),
                    }
                    acc.loss_sum += loss_value;
                    acc.micro_batches += 1;
                    acc.samples += texts.len();
                }

                let last_in_epoch = batch_idx + 1 == num_batches;
                let boundary = (batch_idx + 1) % grad_accum == 0 || last_in_epoch;
                if !boundary {
                    continue;
                }
                let Some(mut grads) = acc.grads.take() else {
                    continue;
                };

                let grad_norm = optimizer.step_with_clipping(&mut grads, self.config.max_grad_norm)?;
                let step_loss = acc.loss_sum / acc.micro_batches.max(1) as f64;
                let samples = acc.samples;
                acc = Accumulation::default();

                metrics.learning_rate = scheduler.get_lr();
                optimizer.set_learning_rate(scheduler.step());
                metrics.global_step += 1;
                metrics.epoch = metrics.global_step as f64 / steps_per_epoch as f64;
                metrics.grad_norm = grad_norm;
                metrics.samples_per_second = samples as f64 / step_start.elapsed().as_secs_f64().max(1e-9);
                step_start = Instant::now();

                history.push(step_loss);
                loss_since_log += step_loss;
                steps_since_log += 1;

                if self.config.logging_steps > 0 && metrics.global_step % self.config.logging_steps == 0 {
                    metrics.train_loss = loss_since_log / steps_since_log as f64;
                    loss_since_log = 0.0;
                    steps_since_log = 0;

                    log_history.push(LogEntry {
                        step: metrics.global_step,
                        epoch: metrics.epoch,
                        loss: metrics.train_loss,
                        learning_rate: metrics.learning_rate,
                        grad_norm: Some(grad_norm),
                    });
                    tracing::info!("{}", metrics);
                    if let Some(ref callback) = progress_callback {
                        callback(&metrics);
                    }
                }

                if self.config.save_steps > 0 && metrics.global_step % self.config.save_steps == 0 {
                    let state = self.state(&metrics, total_steps, &log_history);
                    checkpoint_path = Some(checkpoints.save(model, &state)?);
                }

                if metrics.global_step >= total_steps {
                    break 'epochs;
                }
            }

            tracing::info!(
                "Epoch {} completed in {:.1}s",
                epoch + 1,
                epoch_start.elapsed().as_secs_f64()
            );
        }

        if steps_since_log > 0 {
            metrics.train_loss = loss_since_log / steps_since_log as f64;
        }

        let train_loss = if history.is_empty() {
            0.0
        } else {
            history.iter().sum::<f64>() / history.len() as f64
        };
        let train_runtime = run_start.elapsed().as_secs_f64();

        tracing::info!(
            "Training finished: {} steps in {:.1}s, train_loss={:.4}",
            metrics.global_step,
            train_runtime,
            train_loss
        );

        Ok(TrainingResult {
            metrics,
            checkpoint_path,
            history,
            log_history,
            train_loss,
            train_runtime,
        })
    }

    fn state(&self, metrics: &TrainingMetrics, total_steps: usize, log_history: &[LogEntry]) -> TrainerState {
        TrainerState {
            global_step: metrics.global_step,
            epoch: metrics.epoch,
            max_steps: total_steps,
            num_train_epochs: self.config.num_train_epochs,
            logging_steps: self.config.logging_steps,
            save_steps: self.config.save_steps,
            train_batch_size: self.config.per_device_train_batch_size,
            log_history: log_history.to_vec(),
            timestamp: None,
        }
    }
}
