//! Configuration types shared by the voxtrain experiments.

use crate::{Result, VoxError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;

/// Checkpoint retention policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Number of best checkpoints (lowest `val_loss`) to keep.
    #[serde(default = "default_kbest_n")]
    pub kbest_n: usize,

    /// Number of most recent checkpoints to keep.
    #[serde(default = "default_latest_n")]
    pub latest_n: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            kbest_n: default_kbest_n(),
            latest_n: default_latest_n(),
        }
    }
}

/// Hyperparameters for epoch-driven training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochTrainingConfig {
    /// Number of epochs to train.
    #[serde(default = "default_n_epoch")]
    pub n_epoch: usize,

    /// Initial learning rate.
    #[serde(default = "default_lr")]
    pub lr: f64,

    /// Multiplicative learning-rate decay applied once per epoch.
    #[serde(default = "default_lr_decay")]
    pub lr_decay: f64,

    /// L2 regularization coefficient.
    #[serde(default)]
    pub weight_decay: f64,

    /// Log validation progress every N batches.
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,

    /// Extra log file for this run.
    #[serde(default)]
    pub log_path: Option<String>,

    /// Seed for shuffling and parameter initialization.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for EpochTrainingConfig {
    fn default() -> Self {
        Self {
            n_epoch: default_n_epoch(),
            lr: default_lr(),
            lr_decay: default_lr_decay(),
            weight_decay: 0.0,
            log_interval: default_log_interval(),
            log_path: None,
            seed: default_seed(),
        }
    }
}

/// Settings used when running a trained model over a test set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestingConfig {
    /// Extra log file for the test run.
    #[serde(default)]
    pub log_path: Option<String>,
}

/// Read a YAML config file into `T`.
pub fn load_yaml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        VoxError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    tracing::debug!(path = %path.display(), "Loading YAML config");
    Ok(serde_yaml::from_str(&content)?)
}

/// Write `config` as YAML to `path`.
pub fn dump_yaml<T: Serialize>(config: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(path, yaml)?;
    tracing::debug!(path = %path.display(), "Wrote YAML config");
    Ok(())
}

fn default_kbest_n() -> usize {
    5
}
fn default_latest_n() -> usize {
    1
}
fn default_n_epoch() -> usize {
    10
}
fn default_lr() -> f64 {
    1e-3
}
fn default_lr_decay() -> f64 {
    1.0
}
fn default_log_interval() -> usize {
    100
}
fn default_seed() -> u64 {
    42
}
