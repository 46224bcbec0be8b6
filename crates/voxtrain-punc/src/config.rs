//! Punctuation experiment configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use voxtrain_core::{CheckpointConfig, EpochTrainingConfig, TestingConfig};

use crate::error::{PuncError, Result};

/// Classifier architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Unidirectional LSTM language-model style tagger.
    Lstm,
    /// Bidirectional LSTM tagger.
    Blstm,
}

/// Constructor arguments for either architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Word vocabulary size, including reserved ids.
    pub vocab_size: i32,
    /// Number of punctuation classes, including the blank class.
    #[serde(alias = "num_class")]
    pub punc_size: i32,
    /// LSTM hidden size.
    pub hidden_size: i32,
    /// Embedding size; defaults to `hidden_size`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_size: Option<i32>,
    /// Stacked LSTM layers.
    #[serde(default = "default_num_layers")]
    pub num_layers: i32,
    /// Half-width of the uniform initializer.
    #[serde(default = "default_init_scale")]
    pub init_scale: f32,
    /// Dropout probability.
    #[serde(default)]
    pub dropout: f32,
}

impl ModelParams {
    /// Embedding size actually used.
    pub fn embedding_size(&self) -> i32 {
        self.embedding_size.unwrap_or(self.hidden_size)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("punc_size", self.punc_size),
            ("hidden_size", self.hidden_size),
            ("embedding_size", self.embedding_size()),
            ("num_layers", self.num_layers),
        ];
        for (name, value) in sizes {
            if value <= 0 {
                return Err(PuncError::Config(format!("{} must be positive, got {}", name, value)));
            }
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(PuncError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Corpus reader selection. Only the whitespace-tokenized corpus is supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetType {
    /// Pre-tokenized text with standalone punctuation tokens.
    #[default]
    PuncCh,
}

/// Arguments shared by every split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataParams {
    /// Word list, one entry per line.
    pub vocab_file: PathBuf,
    /// Punctuation list, one entry per line.
    pub punc_file: PathBuf,
    /// Words per row.
    #[serde(default = "default_seq_len")]
    pub seq_len: usize,
}

/// Data section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Corpus reader.
    #[serde(default)]
    pub dataset_type: DatasetType,
    /// Training text.
    #[serde(default)]
    pub train_path: Option<PathBuf>,
    /// Validation text.
    #[serde(default)]
    pub dev_path: Option<PathBuf>,
    /// Test text.
    #[serde(default)]
    pub test_path: Option<PathBuf>,
    /// Vocabulary and row layout.
    pub data_params: DataParams,
    /// Rows per batch, per rank.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Accepted for compatibility; loading is synchronous.
    #[serde(default)]
    pub num_workers: usize,
    /// Reshuffle the training rows every epoch. Off by default, so rows are
    /// visited in corpus order.
    #[serde(default)]
    pub shuffle: bool,
}

/// Loss selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossType {
    /// Token-level cross-entropy.
    #[default]
    Ce,
}

/// Full punctuation experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PuncConfig {
    /// Data section.
    pub data: DataConfig,
    /// Checkpoint retention.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Architecture.
    pub model_type: ModelType,
    /// Architecture arguments.
    pub model_params: ModelParams,
    /// Training loss.
    #[serde(default)]
    pub loss_type: LossType,
    /// Optimization settings.
    #[serde(default)]
    pub training: EpochTrainingConfig,
    /// Test-time settings.
    #[serde(default)]
    pub testing: TestingConfig,
}

impl PuncConfig {
    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        self.model_params.validate()?;
        if self.data.batch_size == 0 {
            return Err(PuncError::Config("batch_size must be positive".into()));
        }
        if self.data.data_params.seq_len == 0 {
            return Err(PuncError::Config("seq_len must be positive".into()));
        }
        if self.training.lr <= 0.0 {
            return Err(PuncError::Config(format!(
                "lr must be positive, got {}",
                self.training.lr
            )));
        }
        Ok(())
    }

    /// Path of a split, or a config error naming the missing key.
    pub fn split_path(&self, split: &str) -> Result<&PathBuf> {
        let path = match split {
            "train" => self.data.train_path.as_ref(),
            "dev" => self.data.dev_path.as_ref(),
            "test" => self.data.test_path.as_ref(),
            _ => None,
        };
        path.ok_or_else(|| PuncError::Config(format!("data.{}_path is not set", split)))
    }

    /// Configuration written by `sample-config`.
    pub fn sample() -> Self {
        Self {
            data: DataConfig {
                dataset_type: DatasetType::PuncCh,
                train_path: Some("data/train.txt".into()),
                dev_path: Some("data/dev.txt".into()),
                test_path: Some("data/test.txt".into()),
                data_params: DataParams {
                    vocab_file: "data/vocab".into(),
                    punc_file: "data/punc_vocab".into(),
                    seq_len: default_seq_len(),
                },
                batch_size: default_batch_size(),
                num_workers: 0,
                shuffle: false,
            },
            checkpoint: CheckpointConfig::default(),
            model_type: ModelType::Blstm,
            model_params: ModelParams {
                vocab_size: 3000,
                punc_size: 4,
                hidden_size: 512,
                embedding_size: Some(256),
                num_layers: 2,
                init_scale: default_init_scale(),
                dropout: 0.0,
            },
            loss_type: LossType::Ce,
            training: EpochTrainingConfig::default(),
            testing: TestingConfig::default(),
        }
    }
}

fn default_num_layers() -> i32 {
    1
}
fn default_init_scale() -> f32 {
    0.1
}
fn default_seq_len() -> usize {
    100
}
fn default_batch_size() -> usize {
    64
}
