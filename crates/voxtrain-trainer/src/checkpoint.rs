//! Training checkpoint save/load with k-best and latest-n retention.
//!
//! Every checkpoint is three files sharing a tag:
//!
//! - `{tag}.safetensors`: model parameters
//! - `{tag}.opt.safetensors`: optimizer state (omitted when empty)
//! - `{tag}.json`: [`CheckpointInfos`]
//!
//! Two record files, `checkpoint_best` and `checkpoint_latest`, list the tags
//! currently retained. A tag's files are deleted once it drops out of both.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use mlx_rs::module::ModuleParameters;
use mlx_rs::Array;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainerError};

const BEST_RECORD: &str = "checkpoint_best";
const LATEST_RECORD: &str = "checkpoint_latest";
const RECORD_PREFIX: &str = "model_checkpoint_path:";

/// Auxiliary values stored next to a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfos {
    /// Iteration counter at save time.
    pub step: usize,
    /// Epoch counter at save time.
    pub epoch: usize,
    /// Learning rate at save time.
    #[serde(default)]
    pub lr: f64,
    /// Validation loss; drives k-best retention when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_loss: Option<f64>,
    /// Macro F1 of the validation pass.
    #[serde(rename = "F1", default, skip_serializing_if = "Option::is_none")]
    pub f1: Option<f64>,
    /// Anything else the caller wants to keep.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A checkpoint read back from disk.
#[derive(Debug)]
pub struct Checkpoint {
    /// Tag the checkpoint was saved under.
    pub tag: String,
    /// Flattened model parameters.
    pub params: HashMap<String, Array>,
    /// Flattened optimizer state.
    pub optimizer: HashMap<String, Array>,
    /// Auxiliary values.
    pub infos: CheckpointInfos,
}

/// Flatten a module's parameters, optionally under `{prefix}.`.
pub fn module_state<M: ModuleParameters>(model: &M, prefix: Option<&str>) -> HashMap<String, Array> {
    model
        .parameters()
        .flatten()
        .into_iter()
        .map(|(k, v)| (prefixed(prefix, &k), v.clone()))
        .collect()
}

/// Copy parameters from `state` into `model`.
///
/// Every model parameter must be present with a matching shape.
pub fn load_module_state<M: ModuleParameters>(
    model: &mut M,
    state: &HashMap<String, Array>,
    prefix: Option<&str>,
) -> Result<()> {
    for (name, param) in model.parameters_mut().flatten() {
        let key = prefixed(prefix, &name);
        let value = state
            .get(&key)
            .ok_or_else(|| TrainerError::Checkpoint(format!("missing parameter `{}`", key)))?;
        if value.shape() != param.shape() {
            return Err(TrainerError::Checkpoint(format!(
                "shape mismatch for `{}`: checkpoint {:?}, model {:?}",
                key,
                value.shape(),
                param.shape()
            )));
        }
        *param = value.clone();
    }
    Ok(())
}

fn prefixed(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(p) => format!("{}.{}", p, name),
        None => name.to_string(),
    }
}

/// Checkpoint manager with k-best and latest-n retention.
#[derive(Debug)]
pub struct Checkpointer {
    dir: PathBuf,
    kbest_n: usize,
    latest_n: usize,
    best: Vec<(String, f64)>,
    latest: VecDeque<String>,
}

impl Checkpointer {
    /// Open (or create) a checkpoint directory.
    ///
    /// Existing record files are read so retention continues across restarts.
    pub fn new(dir: impl AsRef<Path>, kbest_n: usize, latest_n: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let best = read_record(&dir.join(BEST_RECORD))?
            .into_iter()
            .filter_map(|(tag, metric)| metric.map(|m| (tag, m)))
            .collect();
        let latest = read_record(&dir.join(LATEST_RECORD))?
            .into_iter()
            .map(|(tag, _)| tag)
            .collect();

        Ok(Self {
            dir,
            kbest_n,
            latest_n,
            best,
            latest,
        })
    }

    /// Checkpoint directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Tags in the k-best record, best first.
    pub fn best_tags(&self) -> Vec<String> {
        let mut best = self.best.clone();
        best.sort_by(|a, b| a.1.total_cmp(&b.1));
        best.into_iter().map(|(tag, _)| tag).collect()
    }

    /// Most recently saved retained tag.
    pub fn latest_tag(&self) -> Option<&str> {
        self.latest.back().map(String::as_str)
    }

    /// Save a checkpoint and apply retention.
    ///
    /// Returns the path of the parameter file.
    pub fn add_checkpoint(
        &mut self,
        tag: &str,
        params: &HashMap<String, Array>,
        optimizer: &HashMap<String, Array>,
        infos: &CheckpointInfos,
    ) -> Result<PathBuf> {
        let keep_best = match infos.val_loss {
            Some(metric) if !metric.is_finite() => {
                tracing::warn!(tag, metric, "Non-finite val_loss, not ranked among the best");
                false
            }
            Some(metric) if self.kbest_n > 0 => self.should_keep_best(metric),
            _ => false,
        };

        let base = self.dir.join(tag);
        let params_path = with_suffix(&base, ".safetensors");
        Array::save_safetensors(params.clone(), None, &params_path).map_err(|e| {
            TrainerError::Checkpoint(format!("failed to save {}: {}", params_path.display(), e))
        })?;
        if !optimizer.is_empty() {
            let opt_path = with_suffix(&base, ".opt.safetensors");
            Array::save_safetensors(optimizer.clone(), None, &opt_path).map_err(|e| {
                TrainerError::Checkpoint(format!("failed to save {}: {}", opt_path.display(), e))
            })?;
        }
        fs::write(with_suffix(&base, ".json"), serde_json::to_string_pretty(infos)?)?;

        if keep_best {
            if let Some(metric) = infos.val_loss {
                self.push_best(tag, metric)?;
            }
        }
        self.push_latest(tag)?;
        self.write_records()?;

        tracing::info!(tag, path = %params_path.display(), "Saved checkpoint");
        Ok(params_path)
    }

    fn should_keep_best(&self, metric: f64) -> bool {
        if self.best.len() < self.kbest_n {
            return true;
        }
        self.worst_best()
            .map(|i| metric < self.best[i].1)
            .unwrap_or(true)
    }

    fn worst_best(&self) -> Option<usize> {
        self.best
            .iter()
            .enumerate()
            .max_by(|a, b| a.1 .1.total_cmp(&b.1 .1))
            .map(|(i, _)| i)
    }

    fn push_best(&mut self, tag: &str, metric: f64) -> Result<()> {
        self.best.retain(|(t, _)| t != tag);
        if self.best.len() >= self.kbest_n {
            if let Some(i) = self.worst_best() {
                let (evicted, _) = self.best.remove(i);
                if !self.latest.contains(&evicted) {
                    self.remove_files(&evicted)?;
                }
            }
        }
        self.best.push((tag.to_string(), metric));
        Ok(())
    }

    fn push_latest(&mut self, tag: &str) -> Result<()> {
        if !self.latest.iter().any(|t| t == tag) {
            self.latest.push_back(tag.to_string());
        }
        while self.latest.len() > self.latest_n {
            if let Some(evicted) = self.latest.pop_front() {
                if !self.best.iter().any(|(t, _)| *t == evicted) {
                    self.remove_files(&evicted)?;
                }
            }
        }
        Ok(())
    }

    fn remove_files(&self, tag: &str) -> Result<()> {
        let base = self.dir.join(tag);
        for suffix in [".safetensors", ".opt.safetensors", ".json"] {
            let path = with_suffix(&base, suffix);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        tracing::debug!(tag, "Removed checkpoint");
        Ok(())
    }

    fn write_records(&self) -> Result<()> {
        let best: String = self
            .best
            .iter()
            .map(|(tag, metric)| format!("{} {}, val_loss: {}\n", RECORD_PREFIX, tag, metric))
            .collect();
        fs::write(self.dir.join(BEST_RECORD), best)?;

        let latest: String = self
            .latest
            .iter()
            .map(|tag| format!("{} {}\n", RECORD_PREFIX, tag))
            .collect();
        fs::write(self.dir.join(LATEST_RECORD), latest)?;
        Ok(())
    }

    /// Load a checkpoint.
    ///
    /// With an explicit path (with or without the `.safetensors` suffix) that
    /// checkpoint is loaded. Otherwise the newest entry of the latest record
    /// is used. Returns `Ok(None)` when there is nothing to load.
    pub fn load_parameters(&self, checkpoint_path: Option<&Path>) -> Result<Option<Checkpoint>> {
        let base = match checkpoint_path {
            Some(path) => checkpoint_base(path),
            None => {
                let records = read_record(&self.dir.join(LATEST_RECORD))?;
                match records.last() {
                    Some((tag, _)) => self.dir.join(tag),
                    None => return Ok(None),
                }
            }
        };
        load_checkpoint(&base).map(Some)
    }
}

/// Load the checkpoint whose files share the path prefix `base`.
pub fn load_checkpoint(base: &Path) -> Result<Checkpoint> {
    let params_path = with_suffix(base, ".safetensors");
    if !params_path.exists() {
        return Err(TrainerError::Checkpoint(format!(
            "{} does not exist",
            params_path.display()
        )));
    }
    let params = Array::load_safetensors(&params_path).map_err(|e| {
        TrainerError::Checkpoint(format!("failed to load {}: {}", params_path.display(), e))
    })?;

    let opt_path = with_suffix(base, ".opt.safetensors");
    let optimizer = if opt_path.exists() {
        Array::load_safetensors(&opt_path).map_err(|e| {
            TrainerError::Checkpoint(format!("failed to load {}: {}", opt_path.display(), e))
        })?
    } else {
        HashMap::new()
    };

    let infos_path = with_suffix(base, ".json");
    let infos: CheckpointInfos = if infos_path.exists() {
        serde_json::from_str(&fs::read_to_string(&infos_path)?)?
    } else {
        CheckpointInfos::default()
    };

    let tag = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tracing::info!(tag = %tag, step = infos.step, epoch = infos.epoch, "Loaded checkpoint");

    Ok(Checkpoint {
        tag,
        params,
        optimizer,
        infos,
    })
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Base path of a checkpoint given any of its files.
///
/// `.opt.safetensors`, `.safetensors` and `.json` are stripped; any other
/// path is taken to be the base already.
pub fn checkpoint_base(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    for suffix in [".opt.safetensors", ".safetensors", ".json"] {
        if let Some(stripped) = s.strip_suffix(suffix) {
            return PathBuf::from(stripped);
        }
    }
    path.to_path_buf()
}

fn read_record(path: &Path) -> Result<Vec<(String, Option<f64>)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| line.trim().strip_prefix(RECORD_PREFIX))
        .map(|rest| {
            let mut parts = rest.splitn(2, ',');
            let tag = parts.next().unwrap_or_default().trim().to_string();
            let metric = parts
                .next()
                .and_then(|m| m.trim().strip_prefix("val_loss:"))
                .and_then(|m| m.trim().parse::<f64>().ok());
            (tag, metric)
        })
        .filter(|(tag, _)| !tag.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params(v: f32) -> HashMap<String, Array> {
        let mut p = HashMap::new();
        p.insert("w".to_string(), Array::from_slice(&[v, v + 1.0], &[2]));
        p
    }

    fn infos(step: usize, val_loss: Option<f64>) -> CheckpointInfos {
        CheckpointInfos {
            step,
            epoch: step,
            lr: 1e-3,
            val_loss,
            ..Default::default()
        }
    }

    #[test]
    fn test_save_and_load_explicit() {
        let dir = TempDir::new().unwrap();
        let mut ckpt = Checkpointer::new(dir.path(), 5, 1).unwrap();
        let mut opt = HashMap::new();
        opt.insert("w.m".to_string(), Array::from_slice(&[0.5f32, 0.5], &[2]));

        let path = ckpt.add_checkpoint("3", &params(1.0), &opt, &infos(30, Some(0.2))).unwrap();
        assert!(path.ends_with("3.safetensors"));

        let loaded = ckpt.load_parameters(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.tag, "3");
        assert_eq!(loaded.infos.step, 30);
        assert_eq!(loaded.infos.val_loss, Some(0.2));
        assert!(loaded.params.contains_key("w"));
        assert!(loaded.optimizer.contains_key("w.m"));
    }

    #[test]
    fn test_load_latest_and_empty() {
        let dir = TempDir::new().unwrap();
        let mut ckpt = Checkpointer::new(dir.path(), 5, 2).unwrap();
        assert!(ckpt.load_parameters(None).unwrap().is_none());

        for step in [1, 2, 3] {
            ckpt.add_checkpoint(&step.to_string(), &params(step as f32), &HashMap::new(), &infos(step, None))
                .unwrap();
        }
        let latest = ckpt.load_parameters(None).unwrap().unwrap();
        assert_eq!(latest.infos.step, 3);
        assert_eq!(ckpt.latest_tag(), Some("3"));
        // latest_n = 2 and no val_loss: tag 1 is gone
        assert!(!dir.path().join("1.safetensors").exists());
        assert!(dir.path().join("2.safetensors").exists());
    }

    #[test]
    fn test_kbest_keeps_lowest_val_loss() {
        let dir = TempDir::new().unwrap();
        let mut ckpt = Checkpointer::new(dir.path(), 2, 1).unwrap();
        let losses = [0.5, 0.3, 0.4, 0.6, 0.1];
        for (i, loss) in losses.iter().enumerate() {
            ckpt.add_checkpoint(&i.to_string(), &params(0.0), &HashMap::new(), &infos(i, Some(*loss)))
                .unwrap();
        }
        assert_eq!(ckpt.best_tags(), vec!["4".to_string(), "1".to_string()]);
        assert_eq!(ckpt.latest_tag(), Some("4"));
        for tag in ["0", "2", "3"] {
            assert!(!dir.path().join(format!("{}.safetensors", tag)).exists(), "{} kept", tag);
        }
        assert!(dir.path().join("1.json").exists());
    }

    #[test]
    fn test_kbest_ignores_non_finite_val_loss() {
        let dir = TempDir::new().unwrap();
        let mut ckpt = Checkpointer::new(dir.path(), 2, 5).unwrap();
        ckpt.add_checkpoint("0", &params(0.0), &HashMap::new(), &infos(0, Some(0.5)))
            .unwrap();
        ckpt.add_checkpoint("1", &params(1.0), &HashMap::new(), &infos(1, Some(f64::NAN)))
            .unwrap();
        ckpt.add_checkpoint("2", &params(2.0), &HashMap::new(), &infos(2, Some(f64::INFINITY)))
            .unwrap();
        assert_eq!(ckpt.best_tags(), vec!["0".to_string()]);

        let records = fs::read_to_string(dir.path().join(BEST_RECORD)).unwrap();
        assert!(!records.contains("NaN"));
        assert!(!records.contains("inf"));
        assert_eq!(ckpt.latest_tag(), Some("2"));
    }

    #[test]
    fn test_checkpoint_base_strips_known_suffixes() {
        let base = Path::new("ckpt/snapshot_iter_4");
        for name in [
            "ckpt/snapshot_iter_4.opt.safetensors",
            "ckpt/snapshot_iter_4.safetensors",
            "ckpt/snapshot_iter_4.json",
            "ckpt/snapshot_iter_4",
        ] {
            assert_eq!(checkpoint_base(Path::new(name)), base, "{}", name);
        }
        assert_eq!(
            checkpoint_base(Path::new("ckpt/1.5.safetensors")),
            Path::new("ckpt/1.5")
        );
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut ckpt = Checkpointer::new(dir.path(), 1, 1).unwrap();
            ckpt.add_checkpoint("0", &params(0.0), &HashMap::new(), &infos(0, Some(0.9))).unwrap();
        }
        let mut ckpt = Checkpointer::new(dir.path(), 1, 1).unwrap();
        assert_eq!(ckpt.best_tags(), vec!["0".to_string()]);
        ckpt.add_checkpoint("1", &params(1.0), &HashMap::new(), &infos(1, Some(0.1))).unwrap();
        assert_eq!(ckpt.best_tags(), vec!["1".to_string()]);
        assert!(!dir.path().join("0.safetensors").exists());
    }

    #[test]
    fn test_missing_explicit_checkpoint() {
        let dir = TempDir::new().unwrap();
        let ckpt = Checkpointer::new(dir.path(), 1, 1).unwrap();
        let err = ckpt.load_parameters(Some(&dir.path().join("nope"))).unwrap_err();
        assert!(matches!(err, TrainerError::Checkpoint(_)));
    }

    #[test]
    fn test_infos_json_layout() {
        let mut i = infos(7, Some(0.25));
        i.f1 = Some(0.5);
        let json = serde_json::to_value(&i).unwrap();
        assert_eq!(json["step"], 7);
        assert_eq!(json["F1"], 0.5);
    }
}
