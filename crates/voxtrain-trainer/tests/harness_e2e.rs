//! End-to-end harness tests.
//!
//! A one-parameter linear regression is trained through the full stack:
//! - DataLoader → StandardUpdater → AdamL2
//! - Evaluate / Snapshot / Visualize extensions
//! - Resume from the latest snapshot

use std::collections::HashMap;
use std::sync::Arc;

use mlx_rs::{
    error::Exception,
    macros::ModuleParameters,
    module::{ModuleParameters, Param},
    nn,
    optimizers::Optimizer,
    Array,
};
use rand::rngs::StdRng;
use tempfile::TempDir;
use voxtrain_core::{report, CheckpointConfig, Dataset};
use voxtrain_data::{Collator, DataLoader, DataLoaderConfig};
use voxtrain_distributed::DistributedContext;
use voxtrain_trainer::{
    load_module_state, module_state, read_scalars, AdamL2, BatchSource, Checkpoint,
    CheckpointPayload, Evaluate, Evaluator, Experiment, IntervalTrigger, Result, Snapshot,
    StandardUpdater, Trainer, Updater, UpdaterState, Visualize, VISUALIZER_FILE,
};

/// Points on `y = 3x - 1`.
struct LineDataset(Vec<(f32, f32)>);

impl LineDataset {
    fn new(n: usize) -> Self {
        Self(
            (0..n)
                .map(|i| {
                    let x = i as f32 / n as f32;
                    (x, 3.0 * x - 1.0)
                })
                .collect(),
        )
    }
}

impl Dataset for LineDataset {
    type Item = (f32, f32);
    fn len(&self) -> usize {
        self.0.len()
    }
    fn get(&self, index: usize) -> Option<(f32, f32)> {
        self.0.get(index).copied()
    }
}

struct PairCollator;

impl Collator<(f32, f32)> for PairCollator {
    type Batch = (Array, Array);
    fn collate(
        &self,
        samples: Vec<(f32, f32)>,
        _rng: &mut StdRng,
    ) -> voxtrain_core::Result<Option<(Array, Array)>> {
        let n = samples.len() as i32;
        let xs: Vec<f32> = samples.iter().map(|s| s.0).collect();
        let ys: Vec<f32> = samples.iter().map(|s| s.1).collect();
        Ok(Some((
            Array::from_slice(&xs, &[n, 1]),
            Array::from_slice(&ys, &[n, 1]),
        )))
    }
}

#[derive(Debug, ModuleParameters)]
struct Line {
    #[param]
    w: Param<Array>,
    #[param]
    b: Param<Array>,
}

impl Line {
    fn new() -> Self {
        Self {
            w: Param::new(Array::from_slice(&[0.0f32], &[1, 1])),
            b: Param::new(Array::from_slice(&[0.0f32], &[1])),
        }
    }

    fn forward(&self, x: &Array) -> std::result::Result<Array, Exception> {
        x.matmul(self.w.as_ref())?.add(self.b.as_ref())
    }
}

fn mse(model: &Line, x: &Array, y: &Array) -> std::result::Result<Array, Exception> {
    model.forward(x)?.subtract(y)?.square()?.mean(None)
}

type Loader = DataLoader<LineDataset, PairCollator>;

fn loader(n: usize, shuffle: bool) -> Loader {
    DataLoader::new(
        Arc::new(LineDataset::new(n)),
        PairCollator,
        DataLoaderConfig {
            batch_size: 4,
            shuffle,
            ..Default::default()
        },
    )
}

struct LineUpdater {
    inner: StandardUpdater<Loader>,
    model: Line,
    optimizer: AdamL2,
    msg: String,
}

impl LineUpdater {
    fn new() -> Self {
        Self {
            inner: StandardUpdater::new(loader(16, true)),
            model: Line::new(),
            optimizer: AdamL2::new(0.05, 0.0),
            msg: String::new(),
        }
    }
}

impl Updater for LineUpdater {
    fn update(&mut self) -> Result<()> {
        let (x, y) = self.inner.read_batch()?;
        let loss_fn = |m: &mut Line, (x, y): (&Array, &Array)| mse(m, x, y);
        let mut loss_and_grad = nn::value_and_grad(loss_fn);
        let (loss, grads) = loss_and_grad(&mut self.model, (&x, &y))?;
        self.optimizer.update(&mut self.model, grads)?;
        loss.eval()?;
        let loss = loss.item::<f32>();
        report("train/loss", loss);
        self.msg = format!("train/loss: {:.6}", loss);
        self.inner.finish_step();
        Ok(())
    }

    fn state(&self) -> &UpdaterState {
        self.inner.state()
    }

    fn state_mut(&mut self) -> &mut UpdaterState {
        self.inner.state_mut()
    }

    fn msg(&self) -> &str {
        &self.msg
    }

    fn learning_rate(&self) -> Option<f64> {
        Some(f64::from(self.optimizer.learning_rate()))
    }

    fn checkpoint_payload(&self) -> Result<CheckpointPayload> {
        Ok(CheckpointPayload {
            params: module_state(&self.model, None),
            optimizer: self.optimizer.state_dict(),
        })
    }

    fn restore(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        load_module_state(&mut self.model, &checkpoint.params, None)?;
        self.optimizer.load_state_dict(&checkpoint.optimizer)?;
        self.inner.set_state(UpdaterState {
            iteration: checkpoint.infos.step,
            epoch: checkpoint.infos.epoch,
        });
        Ok(())
    }
}

struct LineEvaluator {
    loader: Loader,
}

impl Evaluator<LineUpdater> for LineEvaluator {
    type Loader = Loader;

    fn loader_mut(&mut self) -> &mut Loader {
        &mut self.loader
    }

    fn evaluate_core(
        &mut self,
        updater: &mut LineUpdater,
        (x, y): <Loader as BatchSource>::Batch,
    ) -> Result<()> {
        let loss = mse(&updater.model, &x, &y)?;
        loss.eval()?;
        report("eval/loss", loss.item::<f32>());
        Ok(())
    }
}

fn trainer(exp: Experiment, max_iteration: usize) -> Trainer<LineUpdater> {
    let (checkpointer, visualizer) = exp.into_parts();
    let mut trainer = Trainer::new(LineUpdater::new(), max_iteration).with_log_interval(10);
    trainer.extend(
        Box::new(Evaluate::new(LineEvaluator {
            loader: loader(8, false),
        })),
        IntervalTrigger::iterations(20),
    );
    if let Some(visualizer) = visualizer {
        trainer.extend(Box::new(Visualize::new(visualizer)), IntervalTrigger::iterations(1));
    }
    trainer.extend(Box::new(Snapshot::new(checkpointer)), IntervalTrigger::iterations(20));
    trainer
}

fn setup(output: &std::path::Path) -> Experiment {
    let config: HashMap<String, usize> = [("max_iteration".to_string(), 60)].into_iter().collect();
    Experiment::setup(
        output,
        &config,
        &CheckpointConfig {
            kbest_n: 0,
            latest_n: 2,
        },
        Arc::new(DistributedContext::local()),
    )
    .unwrap()
}

#[test]
fn test_training_reduces_loss() {
    let dir = TempDir::new().unwrap();
    let mut t = trainer(setup(dir.path()), 60);
    t.run().unwrap();

    let state = *t.updater().state();
    assert_eq!(state.iteration, 60);
    // 16 samples / batch 4 = 4 batches per epoch.
    assert_eq!(state.epoch, 14);

    let records = read_scalars(dir.path().join(VISUALIZER_FILE)).unwrap();
    let losses: Vec<f64> = records
        .iter()
        .filter(|r| r.tag == "train/loss")
        .map(|r| r.value)
        .collect();
    assert_eq!(losses.len(), 60);
    assert!(losses[59] < losses[0]);

    let evals: Vec<usize> = records
        .iter()
        .filter(|r| r.tag == "eval/loss")
        .map(|r| r.step)
        .collect();
    assert_eq!(evals, vec![20, 40, 60]);
}

#[test]
fn test_resume_continues_from_latest_snapshot() {
    let dir = TempDir::new().unwrap();
    trainer(setup(dir.path()), 40).run().unwrap();

    let ckpt_dir = dir.path().join("checkpoints");
    assert!(ckpt_dir.join("snapshot_iter_40.safetensors").exists());
    assert!(ckpt_dir.join("snapshot_iter_40.opt.safetensors").exists());

    let mut resumed = trainer(setup(dir.path()), 60);
    resumed.run().unwrap();
    assert_eq!(resumed.updater().state().iteration, 60);
    assert!(!ckpt_dir.join("snapshot_iter_20.safetensors").exists());
    assert!(ckpt_dir.join("snapshot_iter_60.safetensors").exists());

    let trained_w = resumed.updater().model.w.as_ref().clone();
    trained_w.eval().unwrap();
    assert!(trained_w.as_slice::<f32>()[0] > 0.5);
}
