//! Scoring a trained tagger on the test split.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use voxtrain_core::Dataset;
use voxtrain_data::{DataLoader, DataLoaderConfig, PuncCollator};
use voxtrain_distributed::DistributedContext;
use voxtrain_trainer::{load_module_state, Checkpointer};

use crate::config::PuncConfig;
use crate::error::Result;
use crate::metrics::{evaluation, ClassificationReport, PuncEvaluation};
use crate::model::PuncClassifier;
use crate::trainer::{load_split, predict, PuncLoader};

/// Command-line arguments of a test run.
#[derive(Debug, Clone)]
pub struct PuncTestArgs {
    /// Output directory; defaults to the checkpoint's grandparent.
    pub output: Option<PathBuf>,
    /// Checkpoint to score.
    pub checkpoint_path: PathBuf,
    /// Where to write the report text, if anywhere.
    pub result_file: Option<PathBuf>,
}

/// Output of [`PuncTester::test`].
#[derive(Debug, Clone)]
pub struct PuncTestResult {
    /// Per-class report over all test tokens.
    pub report: ClassificationReport,
    /// COMMA / PERIOD / QUESTION table.
    pub evaluation: PuncEvaluation,
}

impl std::fmt::Display for PuncTestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.report)?;
        write!(f, "{}", self.evaluation)
    }
}

/// Runs a trained model over the test split.
pub struct PuncTester<M> {
    args: PuncTestArgs,
    ctx: Arc<DistributedContext>,
    model: M,
    output_dir: PathBuf,
    checkpointer: Checkpointer,
    test_loader: PuncLoader,
    punc_list: Vec<String>,
    iteration: usize,
    epoch: usize,
}

impl<M: PuncClassifier> PuncTester<M> {
    /// Prepare the output directory and test data around `model`.
    pub fn setup(
        config: &PuncConfig,
        args: PuncTestArgs,
        ctx: Arc<DistributedContext>,
        model: M,
    ) -> Result<Self> {
        config.validate()?;
        let output_dir = match &args.output {
            Some(output) => output.clone(),
            None => args
                .checkpoint_path
                .parent()
                .and_then(Path::parent)
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        };
        std::fs::create_dir_all(&output_dir)?;

        let checkpointer = Checkpointer::new(
            output_dir.join("checkpoints"),
            config.checkpoint.kbest_n,
            config.checkpoint.latest_n,
        )?;

        let test_set = load_split(config, "test")?;
        let punc_list = test_set.id2punc().to_vec();
        let test_loader = DataLoader::new(
            test_set,
            PuncCollator,
            DataLoaderConfig {
                batch_size: config.data.batch_size,
                shuffle: false,
                drop_last: false,
                seed: config.training.seed,
                num_replicas: 1,
                rank: 0,
            },
        );
        tracing::info!(output = %output_dir.display(), "Setup test Dataloader!");

        Ok(Self {
            args,
            ctx,
            model,
            output_dir,
            checkpointer,
            test_loader,
            punc_list,
            iteration: 0,
            epoch: 0,
        })
    }

    /// Output directory in use.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Load the checkpoint given in the arguments.
    pub fn resume_or_scratch(&mut self) -> Result<bool> {
        match self
            .checkpointer
            .load_parameters(Some(&self.args.checkpoint_path))?
        {
            Some(checkpoint) => {
                load_module_state(&mut self.model, &checkpoint.params, None)?;
                self.iteration = checkpoint.infos.step;
                self.epoch = checkpoint.infos.epoch;
                Ok(false)
            }
            None => {
                self.iteration = 0;
                self.epoch = 0;
                Ok(true)
            }
        }
    }

    /// Predict every test token and score the predictions.
    pub fn test(&mut self) -> Result<PuncTestResult> {
        tracing::info!(
            "Test Total Examples: {}",
            self.test_loader.dataset().len()
        );
        self.model.set_training(false);
        self.test_loader.set_epoch(0);

        let mut labels = Vec::new();
        let mut preds = Vec::new();
        while let Some(batch) = self.test_loader.next_batch() {
            let (_, _, label_ids, pred_ids) = predict(&mut self.model, &batch?)?;
            labels.extend(label_ids);
            preds.extend(pred_ids);
        }

        tracing::info!("Test: epoch: {}, step: {}, ", self.epoch, self.iteration);
        let result = PuncTestResult {
            report: ClassificationReport::new(&labels, &preds, &self.punc_list)?,
            evaluation: evaluation(&labels, &preds)?,
        };

        if let Some(path) = &self.args.result_file {
            let text = format!(
                "Test: epoch: {}, step: {}\n{}",
                self.epoch, self.iteration, result
            );
            std::fs::write(path, text)?;
            tracing::info!(path = %path.display(), "Wrote test results");
        }
        Ok(result)
    }

    /// Restore the checkpoint and test on rank 0.
    ///
    /// Other ranks return `Ok(None)`.
    pub fn run_test(&mut self) -> Result<Option<PuncTestResult>> {
        if self.resume_or_scratch()? {
            tracing::warn!("No checkpoint found; testing an untrained model");
        }
        if !self.ctx.is_master() {
            return Ok(None);
        }
        self.test().map(Some)
    }
}
