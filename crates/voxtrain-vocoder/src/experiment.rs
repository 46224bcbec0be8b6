//! Training and synthesis entry points for Parallel WaveGAN.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use mlx_rs::Array;
use voxtrain_core::{CheckpointConfig, Dataset, VoxError};
use voxtrain_data::{ClipCollator, DataLoader, DataLoaderConfig, WaveMelDataset};
use voxtrain_distributed::DistributedContext;
use voxtrain_trainer::{
    checkpoint_base, load_checkpoint, load_module_state, Evaluate, Experiment, GradientSync, IntervalTrigger,
    ProgressCallback, Snapshot, Trainer, Visualize,
};

use crate::config::PwgConfig;
use crate::discriminator::PwgDiscriminator;
use crate::error::Result;
use crate::evaluator::PwgEvaluator;
use crate::generator::PwgGenerator;
use crate::updater::{PwgUpdater, GENERATOR_PREFIX};

/// Loader type used for both training and dev data.
pub type WaveMelLoader = DataLoader<WaveMelDataset, ClipCollator>;

/// Input and output locations of a training run.
#[derive(Debug, Clone)]
pub struct PwgPaths {
    /// `metadata.jsonl` of the training set.
    pub train_metadata: PathBuf,
    /// `metadata.jsonl` of the dev set.
    pub dev_metadata: PathBuf,
    /// Experiment output directory.
    pub output: PathBuf,
}

fn build_loader(
    metadata: &Path,
    config: &PwgConfig,
    loader_config: DataLoaderConfig,
) -> Result<WaveMelLoader> {
    let dataset = Arc::new(WaveMelDataset::from_metadata(metadata)?);
    let collator = ClipCollator::new(
        config.batch_max_steps,
        config.n_shift,
        config.generator_params.aux_context_window as usize,
    )?;
    Ok(DataLoader::new(dataset, collator, loader_config))
}

/// Train a Parallel WaveGAN from `config`.
///
/// Resumes from the latest snapshot in `{output}/checkpoints` when present.
pub fn train_pwg(
    config: &PwgConfig,
    paths: &PwgPaths,
    ctx: Arc<DistributedContext>,
    stop: Option<Arc<AtomicBool>>,
) -> Result<()> {
    config.validate()?;
    if config.num_workers > 0 {
        tracing::debug!(num_workers = config.num_workers, "Ignoring num_workers; loading is synchronous");
    }
    mlx_rs::random::seed(config.seed)?;

    let train_loader = build_loader(
        &paths.train_metadata,
        config,
        DataLoaderConfig {
            batch_size: config.batch_size,
            shuffle: true,
            drop_last: true,
            seed: config.seed,
            num_replicas: ctx.world_size(),
            rank: ctx.rank(),
        },
    )?;
    let dev_loader = build_loader(
        &paths.dev_metadata,
        config,
        DataLoaderConfig {
            batch_size: config.batch_size,
            shuffle: false,
            drop_last: false,
            seed: config.seed,
            num_replicas: 1,
            rank: 0,
        },
    )?;
    tracing::info!(
        train_batches = train_loader.num_batches(),
        dev_batches = dev_loader.num_batches(),
        "Data loaders ready"
    );

    let generator = PwgGenerator::new(config.generator_params.clone())?;
    let discriminator = PwgDiscriminator::new(&config.discriminator_params)?;

    let experiment = Experiment::setup(
        &paths.output,
        config,
        &CheckpointConfig {
            kbest_n: 0,
            latest_n: config.num_snapshots,
        },
        ctx.clone(),
    )?;
    let is_master = experiment.is_master();
    let (checkpointer, visualizer) = experiment.into_parts();

    let grad_sync = GradientSync::new(ctx)?;
    let updater = PwgUpdater::new(train_loader, generator, discriminator, config, grad_sync)?;
    let evaluator = PwgEvaluator::new(dev_loader, config.lambda_adv);

    let mut trainer = Trainer::new(updater, config.train_max_steps)
        .with_log_interval(config.log_interval_steps)
        .with_master(is_master);
    if let Some(stop) = stop {
        trainer = trainer.with_stop_flag(stop);
    }

    trainer.extend(
        Box::new(Evaluate::new(evaluator)),
        IntervalTrigger::iterations(config.eval_interval_steps),
    );
    if let Some(visualizer) = visualizer {
        trainer.extend(Box::new(Visualize::new(visualizer)), IntervalTrigger::iterations(1));
    }
    trainer.extend(
        Box::new(Snapshot::new(checkpointer)),
        IntervalTrigger::iterations(config.save_interval_steps),
    );
    if is_master {
        trainer.add_callback(Box::new(ProgressCallback::new(config.train_max_steps)));
    }

    trainer.run()?;
    Ok(())
}

/// Load a generator for inference from a training checkpoint.
///
/// `checkpoint_path` may name any file of the checkpoint or its base path.
/// Weight normalization is folded into the kernels.
pub fn load_generator(config: &PwgConfig, checkpoint_path: &Path) -> Result<PwgGenerator> {
    let checkpoint = load_checkpoint(&checkpoint_base(checkpoint_path))?;
    let mut generator = PwgGenerator::new(config.generator_params.clone())?;
    load_module_state(&mut generator, &checkpoint.params, Some(GENERATOR_PREFIX))?;
    generator.remove_weight_norm()?;
    generator.set_training(false);
    Ok(generator)
}

/// Generate a waveform for every utterance in `metadata`.
///
/// Each result is written to `{output}/{utt_id}.safetensors` under the key
/// `wave`. Returns the number of utterances synthesized.
pub fn synthesize(
    config: &PwgConfig,
    checkpoint_path: &Path,
    metadata: &Path,
    output: &Path,
) -> Result<usize> {
    let mut generator = load_generator(config, checkpoint_path)?;
    let dataset = WaveMelDataset::from_metadata(metadata)?;
    std::fs::create_dir_all(output)?;

    let mut total_samples = 0usize;
    let mut total_secs = 0.0f64;
    for index in 0..dataset.len() {
        let sample = dataset.load(index)?;
        let mel = Array::from_slice(
            &sample.feats,
            &[sample.frames as i32, sample.aux_channels as i32],
        );

        let start = Instant::now();
        let wave = generator.inference(&mel)?;
        wave.eval()?;
        let elapsed = start.elapsed().as_secs_f64();

        let samples = wave.size();
        let speed = samples as f64 / elapsed.max(f64::EPSILON);
        let rtf = f64::from(config.fs) / speed;
        tracing::info!(
            utt_id = %sample.utt_id,
            samples,
            "{}, wave: {}, time: {:.3}s, Hz: {:.1}, RTF: {:.5}.",
            sample.utt_id,
            samples,
            elapsed,
            speed,
            rtf
        );
        total_samples += samples;
        total_secs += elapsed;

        let path = output.join(format!("{}.safetensors", sample.utt_id));
        let tensors: HashMap<String, Array> = [("wave".to_string(), wave)].into_iter().collect();
        Array::save_safetensors(tensors, None, &path)
            .map_err(|e| VoxError::Data(format!("failed to save {}: {}", path.display(), e)))?;
    }

    if total_secs > 0.0 {
        let speed = total_samples as f64 / total_secs;
        tracing::info!(
            "generation speed: {:.1}Hz, RTF: {:.5}",
            speed,
            f64::from(config.fs) / speed
        );
    }
    Ok(dataset.len())
}
