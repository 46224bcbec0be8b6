//! Entry points that pick the architecture named in the configuration.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use voxtrain_distributed::DistributedContext;
use voxtrain_trainer::LoggingCallback;

use crate::config::PuncConfig;
use crate::error::Result;
use crate::model::{PuncClassifier, PuncModel};
use crate::tester::{PuncTestArgs, PuncTestResult, PuncTester};
use crate::trainer::{PuncTrainArgs, PuncTrainer};

fn run_training<M: PuncClassifier + 'static>(
    config: &PuncConfig,
    args: &PuncTrainArgs,
    ctx: Arc<DistributedContext>,
    stop: Option<Arc<AtomicBool>>,
    model: M,
) -> Result<()> {
    let is_master = ctx.is_master();
    let mut trainer = PuncTrainer::setup(config.clone(), args.clone(), ctx, model)?;
    if let Some(stop) = stop {
        trainer = trainer.with_stop_flag(stop);
    }
    if is_master {
        trainer.add_callback(Box::new(LoggingCallback::new(config.training.log_interval)));
    }
    trainer.run()
}

/// Train the tagger described by `config`.
///
/// Resumes from `args.checkpoint_path` or the latest checkpoint in
/// `{output}/checkpoints` when one exists.
pub fn train_punc(
    config: &PuncConfig,
    args: &PuncTrainArgs,
    ctx: Arc<DistributedContext>,
    stop: Option<Arc<AtomicBool>>,
) -> Result<()> {
    config.validate()?;
    mlx_rs::random::seed(config.training.seed)?;
    match PuncModel::build(config.model_type, &config.model_params)? {
        PuncModel::Lstm(model) => run_training(config, args, ctx, stop, model),
        PuncModel::Blstm(model) => run_training(config, args, ctx, stop, model),
    }
}

/// Score a checkpoint on the test split.
///
/// Returns `None` on ranks other than 0.
pub fn test_punc(
    config: &PuncConfig,
    args: &PuncTestArgs,
    ctx: Arc<DistributedContext>,
) -> Result<Option<PuncTestResult>> {
    match PuncModel::build(config.model_type, &config.model_params)? {
        PuncModel::Lstm(model) => PuncTester::setup(config, args.clone(), ctx, model)?.run_test(),
        PuncModel::Blstm(model) => PuncTester::setup(config, args.clone(), ctx, model)?.run_test(),
    }
}
