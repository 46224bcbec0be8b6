//! Epoch-driven training for the punctuation taggers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mlx_rs::{error::Exception, nn, ops::indexing::argmax_axis, optimizers::Optimizer, Array, Dtype};
use voxtrain_core::{Dataset, EvalMetrics, ExponentialDecay, LrScheduler, TrainingCallback, VoxError};
use voxtrain_data::{DataLoader, DataLoaderConfig, PuncBatch, PuncCollator, PuncDataset};
use voxtrain_distributed::DistributedContext;
use voxtrain_trainer::{
    load_module_state, module_state, AdamL2, CheckpointInfos, Checkpointer, CompositeCallback,
    Experiment, GradientSync, Visualizer,
};

use crate::config::PuncConfig;
use crate::error::{into_exception, PuncError, Result};
use crate::loss::cross_entropy;
use crate::metrics::{f1_macro, ClassificationReport};
use crate::model::PuncClassifier;

/// Loader over one split of the punctuation corpus.
pub type PuncLoader = DataLoader<PuncDataset, PuncCollator>;

/// Command-line arguments of a training run.
#[derive(Debug, Clone)]
pub struct PuncTrainArgs {
    /// Experiment output directory.
    pub output: PathBuf,
    /// Checkpoint to start from instead of the latest one in `output`.
    pub checkpoint_path: Option<PathBuf>,
}

/// Load `split` and check it fits the configured model.
pub(crate) fn load_split(config: &PuncConfig, split: &str) -> Result<Arc<PuncDataset>> {
    let params = &config.data.data_params;
    let dataset = PuncDataset::new(
        config.split_path(split)?,
        &params.vocab_file,
        &params.punc_file,
        params.seq_len,
    )?;

    let model = &config.model_params;
    if dataset.vocab_size() > model.vocab_size as usize {
        return Err(PuncError::Config(format!(
            "{} vocabulary has {} entries but vocab_size is {}",
            split,
            dataset.vocab_size(),
            model.vocab_size
        )));
    }
    if dataset.num_classes() > model.punc_size as usize {
        return Err(PuncError::Config(format!(
            "{} punctuation list has {} classes but punc_size is {}",
            split,
            dataset.num_classes(),
            model.punc_size
        )));
    }
    Ok(Arc::new(dataset))
}

/// Run the model over one batch; returns scores and flattened labels.
pub(crate) fn predict<M: PuncClassifier>(model: &mut M, batch: &PuncBatch) -> Result<(Array, Array, Vec<i32>, Vec<i32>)> {
    let labels = batch.labels.reshape(&[-1])?;
    let (y, probs) = model.forward(&batch.input_ids)?;
    let preds = argmax_axis(&probs, 1, None)?.as_dtype(Dtype::Int32)?;
    preds.eval()?;
    labels.eval()?;
    let label_ids = labels.as_slice::<i32>().to_vec();
    let pred_ids = preds.as_slice::<i32>().to_vec();
    Ok((y, labels, label_ids, pred_ids))
}

/// Trainer for a [`PuncClassifier`].
pub struct PuncTrainer<M> {
    config: PuncConfig,
    args: PuncTrainArgs,
    ctx: Arc<DistributedContext>,
    model: M,
    optimizer: AdamL2,
    scheduler: ExponentialDecay,
    grad_sync: GradientSync,
    checkpointer: Checkpointer,
    visualizer: Option<Visualizer>,
    train_loader: PuncLoader,
    valid_loader: PuncLoader,
    punc_list: Vec<String>,
    callbacks: CompositeCallback,
    stop: Option<Arc<AtomicBool>>,
    iteration: usize,
    epoch: usize,
}

impl<M: PuncClassifier + 'static> PuncTrainer<M> {
    /// Prepare the output directory, data and optimizer around `model`.
    pub fn setup(
        config: PuncConfig,
        args: PuncTrainArgs,
        ctx: Arc<DistributedContext>,
        model: M,
    ) -> Result<Self> {
        config.validate()?;
        if config.data.num_workers > 0 {
            tracing::debug!(
                num_workers = config.data.num_workers,
                "Ignoring num_workers; loading is synchronous"
            );
        }

        let experiment = Experiment::setup(&args.output, &config, &config.checkpoint, ctx.clone())?;
        let (checkpointer, visualizer) = experiment.into_parts();

        let training = &config.training;
        let scheduler = ExponentialDecay::new(training.lr, training.lr_decay);
        let optimizer = AdamL2::new(training.lr as f32, training.weight_decay as f32);
        tracing::info!(
            lr = training.lr,
            lr_decay = training.lr_decay,
            weight_decay = training.weight_decay,
            "Setup model/criterion/optimizer/lr_scheduler!"
        );

        let train_set = load_split(&config, "train")?;
        let dev_set = load_split(&config, "dev")?;
        let punc_list = train_set.id2punc().to_vec();
        let train_loader = DataLoader::new(
            train_set,
            PuncCollator,
            DataLoaderConfig {
                batch_size: config.data.batch_size,
                shuffle: config.data.shuffle,
                drop_last: false,
                seed: training.seed,
                num_replicas: ctx.world_size(),
                rank: ctx.rank(),
            },
        );
        let valid_loader = DataLoader::new(
            dev_set,
            PuncCollator,
            DataLoaderConfig {
                batch_size: config.data.batch_size,
                shuffle: false,
                drop_last: false,
                seed: training.seed,
                num_replicas: 1,
                rank: 0,
            },
        );
        tracing::info!("Setup train/valid Dataloader!");

        let grad_sync = GradientSync::new(ctx.clone())?;

        Ok(Self {
            config,
            args,
            ctx,
            model,
            optimizer,
            scheduler,
            grad_sync,
            checkpointer,
            visualizer,
            train_loader,
            valid_loader,
            punc_list,
            callbacks: CompositeCallback::new(),
            stop: None,
            iteration: 0,
            epoch: 0,
        })
    }

    /// Flag that requests a graceful stop when set.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Register a callback.
    pub fn add_callback(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.add(callback);
    }

    /// The model being trained.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Iterations completed so far.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Current epoch.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.scheduler.current_lr()
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Save a checkpoint under `tag` (rank 0 only).
    ///
    /// `step`, `epoch` and `lr` are filled in from the trainer.
    pub fn save(&mut self, tag: &str, mut infos: CheckpointInfos) -> Result<()> {
        if !self.ctx.is_master() {
            return Ok(());
        }
        infos.step = self.iteration;
        infos.epoch = self.epoch;
        infos.lr = f64::from(self.optimizer.learning_rate());

        let params = module_state(&self.model, None);
        let optimizer = self.optimizer.state_dict();
        let path = self
            .checkpointer
            .add_checkpoint(tag, &params, &optimizer, &infos)?;
        self.callbacks.on_save(&path);
        Ok(())
    }

    /// Restore from `checkpoint_path` or the latest checkpoint.
    ///
    /// Returns `true` when nothing was found and training starts from scratch.
    pub fn resume_or_scratch(&mut self) -> Result<bool> {
        let checkpoint = self
            .checkpointer
            .load_parameters(self.args.checkpoint_path.as_deref())?;
        match checkpoint {
            Some(checkpoint) => {
                load_module_state(&mut self.model, &checkpoint.params, None)?;
                if !checkpoint.optimizer.is_empty() {
                    self.optimizer.load_state_dict(&checkpoint.optimizer)?;
                }
                self.iteration = checkpoint.infos.step;
                self.epoch = checkpoint.infos.epoch;
                tracing::info!(
                    tag = %checkpoint.tag,
                    step = self.iteration,
                    epoch = self.epoch,
                    "Restored checkpoint"
                );
                Ok(false)
            }
            None => {
                self.iteration = 0;
                self.epoch = 0;
                Ok(true)
            }
        }
    }

    fn new_epoch(&mut self) {
        self.epoch += 1;
        self.train_loader.set_epoch(self.epoch);
    }

    fn interrupt(&mut self) -> PuncError {
        let step = self.iteration;
        tracing::warn!(step, "Stop requested");
        if let Err(e) = self.save(&step.to_string(), CheckpointInfos::default()) {
            tracing::error!(error = %e, "Failed to save interrupt checkpoint");
        }
        PuncError::Core(VoxError::Interrupted { step })
    }

    fn train_batch(
        &mut self,
        batch: &PuncBatch,
        msg: String,
        labels_seen: &mut Vec<i32>,
        preds_seen: &mut Vec<i32>,
    ) -> Result<()> {
        let start = Instant::now();
        let labels = batch.labels.reshape(&[-1])?;

        let loss_fn = |model: &mut M,
                       (ids, labels): (&Array, &Array)|
         -> std::result::Result<Vec<Array>, Exception> {
            let (y, probs) = model.forward(ids).map_err(into_exception)?;
            let loss = cross_entropy(&y, labels).map_err(into_exception)?;
            Ok(vec![loss, probs])
        };
        let mut loss_and_grad = nn::value_and_grad(loss_fn);
        let (values, mut grads) = loss_and_grad(&mut self.model, (&batch.input_ids, &labels))?;

        self.grad_sync.sync(&mut grads)?;
        self.optimizer.update(&mut self.model, grads)?;

        let preds = argmax_axis(&values[1], 1, None)?.as_dtype(Dtype::Int32)?;
        preds.eval()?;
        labels.eval()?;
        labels_seen.extend_from_slice(labels.as_slice::<i32>());
        preds_seen.extend_from_slice(preds.as_slice::<i32>());

        let train_loss = values[0].item::<f32>();
        tracing::info!(
            "{}train time: {:.3}s, batch size: {}, train_loss: {:.6}",
            msg,
            start.elapsed().as_secs_f64(),
            self.config.data.batch_size,
            train_loss
        );

        if let Some(visualizer) = self.visualizer.as_mut() {
            visualizer.add_scalar("train/train_loss", f64::from(train_loss), self.iteration)?;
        }
        self.iteration += 1;
        Ok(())
    }

    /// Evaluate on the dev split.
    ///
    /// The loss is a batch-size weighted mean; batches with a non-finite loss
    /// are skipped. F1 is the macro average over all predictions.
    pub fn valid(&mut self) -> Result<EvalMetrics> {
        tracing::info!(
            "Valid Total Examples: {}",
            self.valid_loader.dataset().len()
        );
        self.model.set_training(false);
        self.valid_loader.set_epoch(0);

        let log_interval = self.config.training.log_interval;
        let num_batches = self.valid_loader.num_batches();
        let mut num_seen_utts = 1usize;
        let mut total_loss = 0.0f64;
        let mut losses: Vec<f64> = Vec::new();
        let mut all_labels = Vec::new();
        let mut all_preds = Vec::new();

        let mut i = 0usize;
        while let Some(batch) = self.valid_loader.next_batch() {
            let batch = batch?;
            i += 1;
            let (y, labels, label_ids, pred_ids) = predict(&mut self.model, &batch)?;
            all_labels.extend(label_ids);
            all_preds.extend(pred_ids);

            let loss = f64::from(cross_entropy(&y, &labels)?.item::<f32>());
            if loss.is_finite() {
                num_seen_utts += batch.batch_size;
                total_loss += loss * batch.batch_size as f64;
                losses.push(loss);
            }

            if log_interval > 0 && i % log_interval == 0 {
                let mean = losses.iter().sum::<f64>() / losses.len().max(1) as f64;
                tracing::info!(
                    "Valid: Rank: {}, epoch: {}, step: {}, batch : {}/{}, val_loss: {:.6}, val_history_loss: {:.6}",
                    self.ctx.rank(),
                    self.epoch,
                    self.iteration,
                    i,
                    num_batches,
                    mean,
                    total_loss / num_seen_utts as f64
                );
            }
        }

        let val_loss = total_loss / num_seen_utts as f64;
        tracing::info!("Rank {} Val info val_loss {}", self.ctx.rank(), val_loss);
        let f1 = f1_macro(&all_labels, &all_preds)?;
        self.model.set_training(true);
        Ok(EvalMetrics {
            loss: val_loss,
            f1: Some(f1),
        })
    }

    /// Train until `n_epoch`, saving after every epoch.
    pub fn train(&mut self) -> Result<()> {
        let from_scratch = self.resume_or_scratch()?;
        if from_scratch {
            self.save("init", CheckpointInfos::default())?;
        }

        self.scheduler.set_step(self.epoch);
        self.optimizer
            .set_learning_rate(self.scheduler.current_lr() as f32);
        self.train_loader.set_epoch(self.epoch);

        tracing::info!(
            "Train Total Examples: {}",
            self.train_loader.dataset().len()
        );

        let n_epoch = self.config.training.n_epoch;
        while self.epoch < n_epoch {
            self.callbacks.on_epoch_start(self.epoch);
            self.model.set_training(true);
            let num_batches = self.train_loader.num_batches();
            let mut labels_seen = Vec::new();
            let mut preds_seen = Vec::new();

            let mut batch_index = 0usize;
            let mut data_start = Instant::now();
            loop {
                if self.stop_requested() {
                    return Err(self.interrupt());
                }
                let Some(batch) = self.train_loader.next_batch() else {
                    break;
                };
                let batch = batch?;
                batch_index += 1;
                let msg = format!(
                    "Train: Rank: {}, epoch: {}, step: {}, batch : {}/{}, lr: {:.8}, data time: {:.3}s, ",
                    self.ctx.rank(),
                    self.epoch,
                    self.iteration,
                    batch_index,
                    num_batches,
                    self.scheduler.current_lr(),
                    data_start.elapsed().as_secs_f64()
                );
                self.train_batch(&batch, msg, &mut labels_seen, &mut preds_seen)?;
                data_start = Instant::now();
            }

            if !labels_seen.is_empty() {
                let report = ClassificationReport::new(&labels_seen, &preds_seen, &self.punc_list)?;
                tracing::info!("\n{}", report);
            }

            let metrics = self.valid()?;
            tracing::info!(
                "Epoch {} Val info val_loss {}, F1_score {}",
                self.epoch,
                metrics.loss,
                metrics.f1.unwrap_or_default()
            );
            let lr = self.scheduler.current_lr();
            if let Some(visualizer) = self.visualizer.as_mut() {
                visualizer.add_scalar("eval/cv_loss", metrics.loss, self.epoch)?;
                visualizer.add_scalar("eval/lr", lr, self.epoch)?;
            }

            let infos = CheckpointInfos {
                val_loss: Some(metrics.loss),
                f1: metrics.f1,
                ..Default::default()
            };
            let tag = self.epoch.to_string();
            self.save(&tag, infos)?;
            self.callbacks.on_epoch_end(self.epoch, &metrics);

            self.scheduler.step();
            self.optimizer
                .set_learning_rate(self.scheduler.current_lr() as f32);
            self.new_epoch();
        }
        Ok(())
    }

    /// Train, then close the scalar log.
    ///
    /// When the stop flag is set a checkpoint tagged with the iteration is
    /// saved and [`VoxError::Interrupted`] is returned.
    pub fn run(&mut self) -> Result<()> {
        self.callbacks.on_train_start();
        let result = self.train();
        if let Some(visualizer) = self.visualizer.as_mut() {
            if let Err(e) = visualizer.close() {
                tracing::warn!(error = %e, "Failed to close visualizer");
            }
        }
        result?;
        self.callbacks.on_train_end();
        tracing::info!("Training Done.");
        Ok(())
    }

    /// Checkpoint directory.
    pub fn checkpoint_dir(&self) -> &Path {
        self.checkpointer.dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataConfig, DataParams, DatasetType, LossType, ModelParams, ModelType};
    use crate::model::RnnLm;
    use tempfile::TempDir;
    use voxtrain_core::{CheckpointConfig, EpochTrainingConfig};

    fn corpus_config(dir: &Path) -> PuncConfig {
        let vocab: String = (0..10).map(|i| format!("w{}\n", i)).collect();
        std::fs::write(dir.join("vocab"), vocab).unwrap();
        std::fs::write(dir.join("punc_vocab"), "，\n。\n").unwrap();
        let text = "w1 w2 ， w3 w4 。 w5 w6 w7 ， w8 w9 。 ".repeat(4);
        std::fs::write(dir.join("text.txt"), text).unwrap();

        PuncConfig {
            data: DataConfig {
                dataset_type: DatasetType::PuncCh,
                train_path: Some(dir.join("text.txt")),
                dev_path: Some(dir.join("text.txt")),
                test_path: None,
                data_params: DataParams {
                    vocab_file: dir.join("vocab"),
                    punc_file: dir.join("punc_vocab"),
                    seq_len: 3,
                },
                batch_size: 2,
                num_workers: 0,
                shuffle: false,
            },
            checkpoint: CheckpointConfig::default(),
            model_type: ModelType::Lstm,
            model_params: ModelParams {
                vocab_size: 12,
                punc_size: 3,
                hidden_size: 4,
                embedding_size: None,
                num_layers: 1,
                init_scale: 0.1,
                dropout: 0.0,
            },
            loss_type: LossType::Ce,
            training: EpochTrainingConfig::default(),
            testing: Default::default(),
        }
    }

    fn trainer(config: &PuncConfig, output: PathBuf) -> PuncTrainer<RnnLm> {
        let model = RnnLm::new(12, 3, 4, 1, 0.1, 0.0).unwrap();
        let args = PuncTrainArgs {
            output,
            checkpoint_path: None,
        };
        PuncTrainer::setup(config.clone(), args, Arc::new(DistributedContext::local()), model)
            .unwrap()
    }

    fn epoch_ids(trainer: &mut PuncTrainer<RnnLm>, epoch: usize) -> Vec<i32> {
        trainer.train_loader.set_epoch(epoch);
        let mut ids = Vec::new();
        while let Some(batch) = trainer.train_loader.next_batch() {
            let batch = batch.unwrap();
            batch.input_ids.eval().unwrap();
            ids.extend_from_slice(batch.input_ids.as_slice::<i32>());
        }
        ids
    }

    #[test]
    fn test_train_rows_keep_corpus_order() {
        let dir = TempDir::new().unwrap();
        let config = corpus_config(dir.path());
        let mut first = trainer(&config, dir.path().join("a"));
        let mut second = trainer(&config, dir.path().join("b"));

        let order = epoch_ids(&mut first, 0);
        // w1 w2 w3 are ids 3 4 5 after the two reserved words.
        assert_eq!(&order[..3], &[3, 4, 5]);
        assert_eq!(order, epoch_ids(&mut second, 0));
        assert_eq!(order, epoch_ids(&mut first, 1));
    }
}
