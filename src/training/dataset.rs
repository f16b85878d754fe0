//! Dataset loading and batching for supervised fine-tuning
//!
//! A dataset is an ordered list of text records. Records come from a hub
//! dataset split (parquet) or from a local JSONL / JSON / CSV / parquet file.

use anyhow::{Context, Result};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::hub::HubApi;

/// Mega-batch multiplier used by length grouping
const MEGABATCH_MULT: usize = 50;

/// A single training record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextExample {
    /// Text of the configured text field
    pub text: String,
}

/// Dataset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Column / key holding the training text
    pub text_field: String,
    /// Whether to shuffle after loading
    pub shuffle: bool,
    /// Random seed for shuffling
    pub seed: Option<u64>,
    /// Keep only the first N records (after loading, before shuffling)
    pub max_examples: Option<usize>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            text_field: "text".to_string(),
            shuffle: false,
            seed: Some(42),
            max_examples: None,
        }
    }
}

/// Training dataset
#[derive(Debug)]
pub struct TextDataset {
    examples: Vec<TextExample>,
    columns: Vec<String>,
    config: DatasetConfig,
}

impl TextDataset {
    /// Create a new dataset from examples
    pub fn new(examples: Vec<TextExample>, config: DatasetConfig) -> Self {
        let columns = vec![config.text_field.clone()];
        Self {
            examples,
            columns,
            config,
        }
    }

    fn finish(mut examples: Vec<TextExample>, columns: Vec<String>, config: DatasetConfig) -> Self {
        if let Some(max) = config.max_examples {
            examples.truncate(max);
        }

        let mut dataset = Self {
            examples,
            columns,
            config,
        };

        if dataset.config.shuffle {
            dataset.shuffle();
        }

        dataset
    }

    /// Load dataset from a JSONL file
    ///
    /// Expected format (one JSON object per line):
    /// ```json
    /// {"text": "<s>[INST] ... [/INST] ... </s>"}
    /// ```
    pub fn from_jsonl(path: impl AsRef<Path>, config: DatasetConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open dataset file: {:?}", path))?;
        let reader = BufReader::new(file);

        let mut examples = Vec::new();
        let mut columns: Vec<String> = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read line {}", line_num + 1))?;

            if line.trim().is_empty() {
                continue;
            }

            let record: serde_json::Value = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse JSON at line {}", line_num + 1))?;

            if columns.is_empty() {
                if let Some(obj) = record.as_object() {
                    columns = obj.keys().cloned().collect();
                }
            }

            let text = text_from_record(&record, &config.text_field)
                .with_context(|| format!("Invalid record at line {}", line_num + 1))?;
            examples.push(TextExample { text });
        }

        tracing::info!("Loaded {} training examples from {:?}", examples.len(), path);

        Ok(Self::finish(examples, columns, config))
    }

    /// Load dataset from a JSON array of objects
    pub fn from_json_array(path: impl AsRef<Path>, config: DatasetConfig) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read file: {:?}", path))?;
        let records: Vec<serde_json::Value> =
            serde_json::from_str(&content).context("Failed to parse JSON array")?;

        let columns = records
            .first()
            .and_then(|r| r.as_object())
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();

        let examples = records
            .iter()
            .enumerate()
            .map(|(idx, record)| {
                text_from_record(record, &config.text_field)
                    .map(|text| TextExample { text })
                    .with_context(|| format!("Invalid record at index {}", idx))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!("Loaded {} training examples from {:?}", examples.len(), path);

        Ok(Self::finish(examples, columns, config))
    }

    /// Load dataset from a CSV file with a header row
    pub fn from_csv(path: impl AsRef<Path>, config: DatasetConfig) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Failed to open CSV file: {:?}", path))?;

        let headers = reader.headers()?.clone();
        let columns: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
        let text_idx = headers
            .iter()
            .position(|h| h == config.text_field)
            .ok_or_else(|| anyhow::anyhow!("CSV must have '{}' column", config.text_field))?;

        let mut examples = Vec::new();
        for (row_num, result) in reader.records().enumerate() {
            let record = result.with_context(|| format!("Failed to read CSV row {}", row_num + 1))?;
            let text = record
                .get(text_idx)
                .ok_or_else(|| anyhow::anyhow!("Missing '{}' at row {}", config.text_field, row_num + 1))?
                .to_string();
            examples.push(TextExample { text });
        }

        tracing::info!("Loaded {} training examples from {:?}", examples.len(), path);

        Ok(Self::finish(examples, columns, config))
    }

    /// Load dataset rows from one or more parquet files
    pub fn from_parquet(paths: &[impl AsRef<Path>], config: DatasetConfig) -> Result<Self> {
        let mut examples = Vec::new();
        let mut columns: Vec<String> = Vec::new();

        for path in paths {
            let path = path.as_ref();
            let file = File::open(path)
                .with_context(|| format!("Failed to open parquet file: {:?}", path))?;
            let reader = SerializedFileReader::new(file)
                .with_context(|| format!("Failed to read parquet file: {:?}", path))?;

            if columns.is_empty() {
                columns = reader
                    .metadata()
                    .file_metadata()
                    .schema_descr()
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect();
            }

            let rows = reader
                .get_row_iter(None)
                .with_context(|| format!("Failed to iterate parquet rows: {:?}", path))?;

            for (row_num, row) in rows.enumerate() {
                let row = row.with_context(|| format!("Failed to decode parquet row {}", row_num))?;
                let text = row
                    .get_column_iter()
                    .find(|(name, _)| name.as_str() == config.text_field)
                    .and_then(|(_, field)| match field {
                        Field::Str(s) => Some(s.clone()),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "Row {} of {:?} has no string column '{}'",
                            row_num,
                            path,
                            config.text_field
                        )
                    })?;
                examples.push(TextExample { text });
            }
        }

        tracing::info!("Loaded {} training examples from parquet", examples.len());

        Ok(Self::finish(examples, columns, config))
    }

    /// Load a split of a dataset hosted on the HuggingFace Hub
    pub fn from_hub(dataset_id: &str, split: &str, config: DatasetConfig) -> Result<Self> {
        let hub = HubApi::new()?;
        let files = hub.download_dataset(dataset_id, split)?;
        Self::from_parquet(&files, config)
    }

    /// Load dataset from file, auto-detecting format
    pub fn load(path: impl AsRef<Path>, config: DatasetConfig) -> Result<Self> {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match extension.to_lowercase().as_str() {
            "jsonl" => Self::from_jsonl(path, config),
            "json" if starts_with_array(path)? => Self::from_json_array(path, config)
                .with_context(|| format!("Invalid JSON dataset {:?}", path)),
            "json" => Self::from_jsonl(path, config),
            "csv" => Self::from_csv(path, config),
            "parquet" => Self::from_parquet(&[path], config),
            _ => Self::from_jsonl(path, config.clone()).or_else(|_| Self::from_csv(path, config)),
        }
    }

    /// Load from a local file when `source` exists on disk, from the hub otherwise
    pub fn load_source(source: &str, split: &str, config: DatasetConfig) -> Result<Self> {
        if Path::new(source).exists() {
            Self::load(source, config)
        } else {
            Self::from_hub(source, split, config)
        }
    }

    /// Get the number of examples
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Get an example by index
    pub fn get(&self, index: usize) -> Option<&TextExample> {
        self.examples.get(index)
    }

    /// Iterate over examples
    pub fn iter(&self) -> impl Iterator<Item = &TextExample> {
        self.examples.iter()
    }

    /// Column names of the source
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// `(rows, columns)` of the source table
    pub fn shape(&self) -> (usize, usize) {
        (self.examples.len(), self.columns.len().max(1))
    }

    /// Render one record for inspection
    pub fn preview(&self, index: usize) -> Option<String> {
        self.get(index).map(|ex| {
            serde_json::json!({ self.config.text_field.as_str(): ex.text }).to_string()
        })
    }

    /// Shuffle the dataset
    pub fn shuffle(&mut self) {
        use rand::seq::SliceRandom;

        let mut rng = rng_from_seed(self.config.seed);
        self.examples.shuffle(&mut rng);
    }

    /// Sequential batches of examples
    pub fn batches(&self, batch_size: usize) -> BatchIterator<'_> {
        let order: Vec<usize> = (0..self.len()).collect();
        BatchIterator::new(self, order, batch_size)
    }

    /// Batches in a seeded random order
    pub fn shuffled_batches(&self, batch_size: usize, seed: Option<u64>) -> BatchIterator<'_> {
        use rand::seq::SliceRandom;

        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(&mut rng_from_seed(seed));
        BatchIterator::new(self, order, batch_size)
    }

    /// Batches of examples of similar length
    ///
    /// `lengths[i]` is the length of example `i` (tokens or characters) and
    /// must cover every example.
    pub fn grouped_batches(
        &self,
        batch_size: usize,
        lengths: &[usize],
        seed: Option<u64>,
    ) -> Result<BatchIterator<'_>> {
        if lengths.len() != self.len() {
            anyhow::bail!(
                "Got {} lengths for a dataset of {} examples",
                lengths.len(),
                self.len()
            );
        }
        let order = length_grouped_indices(lengths, batch_size, seed);
        Ok(BatchIterator::new(self, order, batch_size))
    }
}

fn rng_from_seed(seed: Option<u64>) -> rand::rngs::StdRng {
    use rand::SeedableRng;

    match seed {
        Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
        None => rand::rngs::StdRng::from_entropy(),
    }
}

/// Whether the first non-whitespace byte of a file opens a JSON array
fn starts_with_array(path: &Path) -> Result<bool> {
    use std::io::Read;

    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
    );
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte)? == 0 {
            return Ok(false);
        }
        if !byte[0].is_ascii_whitespace() {
            return Ok(byte[0] == b'[');
        }
    }
}

/// Extract the text field from a JSON record
fn text_from_record(record: &serde_json::Value, field: &str) -> Result<String> {
    match record.get(field) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(other) => anyhow::bail!("Field '{}' is not a string: {}", field, other),
        None => anyhow::bail!("Record has no '{}' field", field),
    }
}

/// Index order that groups similar lengths together
///
/// Indices are shuffled, split into mega-batches of `50 * batch_size`, and
/// each mega-batch is sorted by decreasing length. The overall longest
/// example is then swapped to the very front.
pub fn length_grouped_indices(lengths: &[usize], batch_size: usize, seed: Option<u64>) -> Vec<usize> {
    use rand::seq::SliceRandom;

    let mut indices: Vec<usize> = (0..lengths.len()).collect();
    let mut rng = rng_from_seed(seed);
    indices.shuffle(&mut rng);

    let megabatch_size = MEGABATCH_MULT * batch_size.max(1);
    let mut megabatches: Vec<Vec<usize>> = indices
        .chunks(megabatch_size)
        .map(|megabatch| {
            let mut megabatch = megabatch.to_vec();
            megabatch.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
            megabatch
        })
        .collect();

    let longest = megabatches
        .iter()
        .enumerate()
        .max_by_key(|(i, megabatch)| (lengths[megabatch[0]], std::cmp::Reverse(*i)))
        .map(|(i, _)| i);
    if let Some(longest) = longest.filter(|&i| i > 0) {
        let head = megabatches[0][0];
        megabatches[0][0] = megabatches[longest][0];
        megabatches[longest][0] = head;
    }

    megabatches.into_iter().flatten().collect()
}

/// Batch iterator for training
pub struct BatchIterator<'a> {
    dataset: &'a TextDataset,
    order: Vec<usize>,
    batch_size: usize,
    current_idx: usize,
}

impl<'a> BatchIterator<'a> {
    fn new(dataset: &'a TextDataset, order: Vec<usize>, batch_size: usize) -> Self {
        Self {
            dataset,
            order,
            batch_size: batch_size.max(1),
            current_idx: 0,
        }
    }

    /// Number of batches this iterator yields in total
    pub fn num_batches(&self) -> usize {
        (self.order.len() + self.batch_size - 1) / self.batch_size
    }
}

impl<'a> Iterator for BatchIterator<'a> {
    type Item = Vec<&'a TextExample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx >= self.order.len() {
            return None;
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.order.len());
        let batch: Vec<_> = self.order[self.current_idx..end_idx]
            .iter()
            .filter_map(|&i| self.dataset.get(i))
            .collect();

        self.current_idx = end_idx;

        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}
