//! HuggingFace Hub integration for model and dataset downloading
//!
//! Resolves a model identifier to local files, either from a directory on
//! disk or by downloading through the hub cache.

use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::{Api, ApiRepo};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const SINGLE_WEIGHTS: &str = "model.safetensors";
const WEIGHTS_INDEX: &str = "model.safetensors.index.json";

/// HuggingFace Hub API wrapper
pub struct HubApi {
    api: Api,
}

impl HubApi {
    /// Create a new HubApi instance
    pub fn new() -> Result<Self> {
        let api = Api::new().context("Failed to initialize HuggingFace Hub API")?;
        Ok(Self { api })
    }

    /// Download a model from HuggingFace Hub
    pub fn download_model(&self, model_id: &str) -> Result<ModelPath> {
        tracing::info!("Downloading model from HuggingFace Hub: {}", model_id);

        let repo = self.api.model(model_id.to_string());

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;

        tracing::debug!("Downloaded config.json: {:?}", config_path);

        let weights_files = Self::download_weights(&repo)?;

        let tokenizer_path = repo.get("tokenizer.json").ok();
        let tokenizer_config_path = repo.get("tokenizer_config.json").ok();

        if tokenizer_path.is_none() {
            tracing::warn!("{} has no tokenizer.json", model_id);
        }

        let model_dir = config_path
            .parent()
            .ok_or_else(|| anyhow!("Invalid config path"))?
            .to_path_buf();

        Ok(ModelPath {
            path: model_dir,
            model_id: model_id.to_string(),
            is_local: false,
            config_file: config_path,
            weights_files,
            tokenizer_file: tokenizer_path,
            tokenizer_config_file: tokenizer_config_path,
        })
    }

    /// Single file if present, otherwise every shard named in the index
    fn download_weights(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
        if let Ok(path) = repo.get(SINGLE_WEIGHTS) {
            tracing::debug!("Downloaded {}: {:?}", SINGLE_WEIGHTS, path);
            return Ok(vec![path]);
        }

        let index_path = repo.get(WEIGHTS_INDEX).map_err(|_| {
            anyhow!(
                "No safetensors weights found (tried {} and {})",
                SINGLE_WEIGHTS,
                WEIGHTS_INDEX
            )
        })?;

        shard_names_from_index(&index_path)?
            .iter()
            .map(|shard| {
                tracing::debug!("Downloading shard {}", shard);
                repo.get(shard)
                    .with_context(|| format!("Failed to download weight shard {}", shard))
            })
            .collect()
    }

    /// Download the parquet files making up one split of a hub dataset
    pub fn download_dataset(&self, dataset_id: &str, split: &str) -> Result<Vec<PathBuf>> {
        tracing::info!(
            "Downloading dataset from HuggingFace Hub: {} (split: {})",
            dataset_id,
            split
        );

        let repo = self.api.dataset(dataset_id.to_string());
        let info = repo
            .info()
            .with_context(|| format!("Failed to list files of dataset {}", dataset_id))?;

        let files: Vec<String> = info.siblings.into_iter().map(|s| s.rfilename).collect();
        let split_files = select_split_files(&files, split);

        if split_files.is_empty() {
            anyhow::bail!(
                "Dataset {} has no parquet files for split '{}'",
                dataset_id,
                split
            );
        }

        split_files
            .iter()
            .map(|name| {
                repo.get(name)
                    .with_context(|| format!("Failed to download {}", name))
            })
            .collect()
    }
}

/// Pick the parquet files of `split` from a dataset repo listing
pub fn select_split_files(files: &[String], split: &str) -> Vec<String> {
    let mut selected: Vec<String> = files
        .iter()
        .filter(|f| f.ends_with(".parquet"))
        .filter(|f| {
            let name = f.rsplit('/').next().unwrap_or(f);
            name.starts_with(&format!("{}-", split))
                || name.starts_with(&format!("{}.", split))
                || f.split('/').any(|component| component == split)
        })
        .cloned()
        .collect();
    selected.sort();
    selected
}

/// Shard file names listed in a `model.safetensors.index.json`
pub fn shard_names_from_index(index_path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(index_path)
        .with_context(|| format!("Failed to read {:?}", index_path))?;
    let index: serde_json::Value =
        serde_json::from_str(&content).context("Failed to parse safetensors index")?;

    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("Safetensors index has no weight_map: {:?}", index_path))?;

    let shards: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str())
        .map(|s| s.to_string())
        .collect();

    Ok(shards.into_iter().collect())
}

/// Represents a downloaded or local model path
#[derive(Debug, Clone)]
pub struct ModelPath {
    /// Root directory containing model files
    pub path: PathBuf,
    /// Original model ID
    pub model_id: String,
    /// Whether this is a local path (not downloaded from Hub)
    pub is_local: bool,
    /// Path to config.json
    pub config_file: PathBuf,
    /// Safetensors weight files (one file or all shards)
    pub weights_files: Vec<PathBuf>,
    /// Path to tokenizer.json (optional)
    pub tokenizer_file: Option<PathBuf>,
    /// Path to tokenizer_config.json (optional)
    pub tokenizer_config_file: Option<PathBuf>,
}

impl ModelPath {
    /// Create a ModelPath from a local directory
    pub fn from_local(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            return Err(anyhow!("Model directory does not exist: {:?}", path));
        }

        let config_file = path.join("config.json");
        if !config_file.exists() {
            return Err(anyhow!("config.json not found in {:?}", path));
        }

        let weights_files = find_local_weights(&path)?;

        let tokenizer_file = path.join("tokenizer.json");
        let tokenizer_config_file = path.join("tokenizer_config.json");

        Ok(Self {
            model_id: path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            path: path.clone(),
            is_local: true,
            config_file,
            weights_files,
            tokenizer_file: tokenizer_file.exists().then_some(tokenizer_file),
            tokenizer_config_file: tokenizer_config_file
                .exists()
                .then_some(tokenizer_config_file),
        })
    }

    /// Validate that all required files exist
    pub fn validate(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Err(anyhow!("Config file not found: {:?}", self.config_file));
        }
        if self.weights_files.is_empty() {
            return Err(anyhow!("No weight files for model {}", self.model_id));
        }
        for file in &self.weights_files {
            if !file.exists() {
                return Err(anyhow!("Weights file not found: {:?}", file));
            }
        }
        Ok(())
    }

    /// Read config.json into the dispatch subset
    pub fn hub_config(&self) -> Result<HubModelConfig> {
        HubModelConfig::from_file(&self.config_file)
    }
}

/// Weight files in a local model directory (handles single and sharded safetensors)
fn find_local_weights(model_dir: &Path) -> Result<Vec<PathBuf>> {
    let single_file = model_dir.join(SINGLE_WEIGHTS);
    if single_file.exists() {
        return Ok(vec![single_file]);
    }

    let index = model_dir.join(WEIGHTS_INDEX);
    if index.exists() {
        return Ok(shard_names_from_index(&index)?
            .into_iter()
            .map(|name| model_dir.join(name))
            .collect());
    }

    let mut shards = Vec::new();
    for entry in std::fs::read_dir(model_dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == "safetensors").unwrap_or(false) {
            if let Some(name) = path.file_name() {
                let name_str = name.to_string_lossy();
                if name_str.starts_with("model-") && name_str.contains("-of-") {
                    shards.push(path);
                }
            }
        }
    }

    if shards.is_empty() {
        anyhow::bail!(
            "No safetensors weights found in {:?} (pytorch_model.bin is not supported, convert to safetensors)",
            model_dir
        );
    }

    shards.sort();
    Ok(shards)
}

/// Configuration from HuggingFace model's config.json
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HubModelConfig {
    /// Model architectures (e.g., ["LlamaForCausalLM"])
    #[serde(default)]
    pub architectures: Vec<String>,

    /// Model type (e.g., "llama", "phi")
    pub model_type: Option<String>,

    /// Vocabulary size
    pub vocab_size: Option<usize>,

    /// Hidden size
    pub hidden_size: Option<usize>,

    /// Number of hidden layers
    pub num_hidden_layers: Option<usize>,

    /// Storage dtype of the checkpoint ("float16", "bfloat16", "float32")
    pub torch_dtype: Option<String>,

    /// Any extra fields we don't explicitly handle
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl HubModelConfig {
    /// Load config from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        serde_json::from_str(&content).context("Failed to parse config.json")
    }
}

/// Model loader that handles both local and HuggingFace models
pub struct ModelLoader {
    hub: Option<HubApi>,
}

impl ModelLoader {
    /// Create a new ModelLoader
    pub fn new() -> Result<Self> {
        Ok(Self {
            hub: Some(HubApi::new()?),
        })
    }

    /// Loader that never touches the network
    pub fn offline() -> Self {
        Self { hub: None }
    }

    /// Online loader for hub ids, offline loader for local references
    pub fn for_reference(model_id_or_path: &str) -> Result<Self> {
        if Self::is_local_reference(model_id_or_path) {
            Ok(Self::offline())
        } else {
            Self::new()
        }
    }

    /// Whether an identifier refers to the local filesystem
    pub fn is_local_reference(model_id_or_path: &str) -> bool {
        expand_home(model_id_or_path).exists()
            || model_id_or_path.starts_with('.')
            || model_id_or_path.starts_with('/')
            || model_id_or_path.starts_with('~')
    }

    /// Load model path - auto-detects local vs HuggingFace
    pub fn load_model_path(&self, model_id_or_path: &str) -> Result<ModelPath> {
        let local_path = expand_home(model_id_or_path);

        if local_path.exists() {
            tracing::info!("Loading model from local path: {}", local_path.display());
            ModelPath::from_local(&local_path)
        } else if Self::is_local_reference(model_id_or_path) {
            Err(anyhow!(
                "Local model path does not exist: {}",
                local_path.display()
            ))
        } else {
            let hub = self.hub.as_ref().ok_or_else(|| {
                anyhow!(
                    "{} is not a local directory and the loader is offline",
                    model_id_or_path
                )
            })?;
            hub.download_model(model_id_or_path)
        }
    }
}

/// Replace a leading `~` with the home directory
pub fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    match std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        Ok(home) => Path::new(&home).join(rest),
        Err(_) => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_path_missing_directory() {
        let result = ModelPath::from_local("/definitely/not/a/model");
        assert!(result.is_err());
    }

    #[test]
    fn test_local_reference_detection() {
        assert!(ModelLoader::is_local_reference("/DATA/phi-2"));
        assert!(ModelLoader::is_local_reference("./models/x"));
        assert!(!ModelLoader::is_local_reference("microsoft/phi-2"));
    }

    #[test]
    fn test_home_expansion() {
        let home = std::env::var("HOME").unwrap();
        assert_eq!(expand_home("~/models/phi-2"), Path::new(&home).join("models/phi-2"));
        assert_eq!(expand_home("~"), Path::new(&home));
        assert_eq!(expand_home("~other/x"), PathBuf::from("~other/x"));
        assert_eq!(expand_home("/DATA/x"), PathBuf::from("/DATA/x"));
    }

    #[test]
    fn test_missing_home_relative_path_is_expanded() {
        let home = std::env::var("HOME").unwrap();
        assert!(ModelLoader::is_local_reference("~/definitely-not-a-model-dir"));

        let err = ModelLoader::offline()
            .load_model_path("~/definitely-not-a-model-dir")
            .unwrap_err();
        let expected = Path::new(&home).join("definitely-not-a-model-dir");
        assert!(err.to_string().contains(&expected.display().to_string()));
    }

    #[test]
    fn test_missing_local_path_is_an_error() {
        let loader = ModelLoader::offline();
        let err = loader.load_model_path("/DATA/NousResearch/nope").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_offline_loader_refuses_hub_ids() {
        let loader = ModelLoader::offline();
        assert!(loader.load_model_path("microsoft/phi-2").is_err());
    }

    #[test]
    fn test_sharded_local_model() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"model_type": "llama"}"#).unwrap();
        std::fs::write(
            dir.path().join(WEIGHTS_INDEX),
            r#"{"weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }}"#,
        )
        .unwrap();

        let model_path = ModelPath::from_local(dir.path()).unwrap();
        let names: Vec<_> = model_path
            .weights_files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors"
            ]
        );
        assert!(model_path.tokenizer_file.is_none());
        // shards referenced by the index are not on disk
        assert!(model_path.validate().is_err());
    }

    #[test]
    fn test_select_split_files() {
        let files = vec![
            "README.md".to_string(),
            "data/train-00000-of-00001-9ad84bb9cf65a42f.parquet".to_string(),
            "data/test-00000-of-00001.parquet".to_string(),
            "train/0000.parquet".to_string(),
            "trainer.parquet".to_string(),
        ];

        let selected = select_split_files(&files, "train");
        assert_eq!(
            selected,
            vec![
                "data/train-00000-of-00001-9ad84bb9cf65a42f.parquet".to_string(),
                "train/0000.parquet".to_string(),
            ]
        );
        assert!(select_split_files(&files, "validation").is_empty());
    }

    #[test]
    fn test_hub_config_parses_dtype() {
        let config: HubModelConfig = serde_json::from_str(
            r#"{"architectures": ["PhiForCausalLM"], "model_type": "phi", "torch_dtype": "float16"}"#,
        )
        .unwrap();
        assert_eq!(config.model_type.as_deref(), Some("phi"));
        assert_eq!(config.torch_dtype.as_deref(), Some("float16"));
    }

    #[test]
    #[ignore]
    fn test_download_guanaco_split() {
        let hub = HubApi::new().unwrap();
        let files = hub
            .download_dataset("mlabonne/guanaco-llama2-1k", "train")
            .unwrap();
        assert!(!files.is_empty());
    }
}
