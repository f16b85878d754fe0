//! Training checkpoints
//!
//! Every `save_steps` optimizer steps the trainer writes
//! `output_dir/checkpoint-{step}/` with the adapter files and a
//! `trainer_state.json`. Older checkpoints beyond `save_total_limit` are
//! removed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::training::models::LoraModel;

/// File holding the trainer state inside a checkpoint
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// One logged training step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    pub loss: f64,
    pub learning_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f64>,
}

/// Progress record written next to each checkpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub max_steps: usize,
    pub num_train_epochs: usize,
    pub logging_steps: usize,
    pub save_steps: usize,
    pub train_batch_size: usize,
    pub log_history: Vec<LogEntry>,
    #[serde(default)]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl TrainerState {
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(TRAINER_STATE_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read trainer state: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse trainer state: {:?}", path))
    }

    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join(TRAINER_STATE_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write trainer state: {:?}", path))
    }
}

/// Writes and rotates `checkpoint-{step}` directories
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    output_dir: PathBuf,
    save_total_limit: Option<usize>,
}

impl CheckpointManager {
    pub fn new(output_dir: impl Into<PathBuf>, save_total_limit: Option<usize>) -> Self {
        Self {
            output_dir: output_dir.into(),
            save_total_limit,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Directory used for the checkpoint at `step`
    pub fn checkpoint_dir(&self, step: usize) -> PathBuf {
        self.output_dir.join(format!("{}{}", CHECKPOINT_PREFIX, step))
    }

    /// Save adapter and state, then enforce `save_total_limit`
    pub fn save<M: LoraModel + ?Sized>(&self, model: &M, state: &TrainerState) -> Result<PathBuf> {
        let dir = self.checkpoint_dir(state.global_step);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create checkpoint directory: {:?}", dir))?;

        model.save_adapter(&dir)?;
        let mut state = state.clone();
        state.timestamp = Some(chrono::Utc::now());
        state.save(&dir)?;

        tracing::info!("Saved checkpoint to {:?}", dir);
        self.rotate()?;
        Ok(dir)
    }

    /// Existing checkpoints sorted by step
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.output_dir.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for entry in std::fs::read_dir(&self.output_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let step = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
                .and_then(|s| s.parse::<usize>().ok());
            if let Some(step) = step {
                checkpoints.push((step, path));
            }
        }
        checkpoints.sort_by_key(|(step, _)| *step);
        Ok(checkpoints)
    }

    fn rotate(&self) -> Result<()> {
        let Some(limit) = self.save_total_limit else {
            return Ok(());
        };
        let checkpoints = self.list()?;
        let excess = checkpoints.len().saturating_sub(limit.max(1));
        for (_, path) in checkpoints.into_iter().take(excess) {
            tracing::info!("Deleting older checkpoint {:?} (save_total_limit={})", path, limit);
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("Failed to remove checkpoint {:?}", path))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::lora::LoraStats;
    use crate::training::models::CausalLanguageModel;
    use candle_core::{Device, Tensor, Var};

    /// Writes a marker file instead of real weights
    struct StubModel(Device);

    impl CausalLanguageModel for StubModel {
        fn forward_train(&self, input_ids: &Tensor, _train: bool) -> Result<Tensor> {
            Ok(input_ids.clone())
        }
        fn vocab_size(&self) -> usize {
            1
        }
        fn device(&self) -> &Device {
            &self.0
        }
    }

    impl LoraModel for StubModel {
        fn lora_stats(&self) -> LoraStats {
            LoraStats::new(1, 0, 0)
        }
        fn trainable_vars(&self) -> Vec<Var> {
            Vec::new()
        }
        fn save_adapter(&self, dir: &Path) -> Result<()> {
            std::fs::write(dir.join("adapter_model.safetensors"), b"stub")?;
            Ok(())
        }
        fn load_adapter(&mut self, _dir: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn state(step: usize) -> TrainerState {
        TrainerState {
            global_step: step,
            epoch: step as f64 / 10.0,
            log_history: vec![LogEntry {
                step,
                epoch: 0.1,
                loss: 2.5,
                learning_rate: 2e-4,
                grad_norm: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_save_writes_state_and_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), None);
        let path = manager.save(&StubModel(Device::Cpu), &state(50)).unwrap();

        assert!(path.ends_with("checkpoint-50"));
        assert!(path.join("adapter_model.safetensors").exists());
        let loaded = TrainerState::load(&path).unwrap();
        assert_eq!(loaded.global_step, 50);
        assert_eq!(loaded.log_history.len(), 1);
        assert!(loaded.timestamp.is_some());
    }

    #[test]
    fn test_rotation_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), Some(2));
        let model = StubModel(Device::Cpu);
        for step in [50, 100, 150] {
            manager.save(&model, &state(step)).unwrap();
        }

        let steps: Vec<usize> = manager.list().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![100, 150]);
        assert!(!dir.path().join("checkpoint-50").exists());
    }

    #[test]
    fn test_list_sorts_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["checkpoint-1000", "checkpoint-50", "checkpoint-x", "logs"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let manager = CheckpointManager::new(dir.path(), None);
        let steps: Vec<usize> = manager.list().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![50, 1000]);
    }
}
