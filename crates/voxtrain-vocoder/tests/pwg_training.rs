//! End-to-end Parallel WaveGAN runs on a tiny synthetic corpus.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use mlx_rs::Array;
use serial_test::serial;
use tempfile::TempDir;
use voxtrain_data::{VocoderBatch, WaveMelDataset};
use voxtrain_distributed::DistributedContext;
use voxtrain_trainer::{
    read_scalars, BatchSource, Evaluator, GradientSync, Updater, VISUALIZER_FILE,
};
use voxtrain_vocoder::{
    load_generator, synthesize, train_pwg, DiscriminatorParams, GeneratorParams, PwgConfig,
    PwgDiscriminator, PwgEvaluator, PwgGenerator, PwgPaths, PwgUpdater, StftLossParams,
};

const AUX: usize = 4;
const HOP: usize = 16;
const FRAMES: usize = 16;

fn tiny_config() -> PwgConfig {
    PwgConfig {
        n_shift: HOP,
        generator_params: GeneratorParams {
            layers: 4,
            stacks: 2,
            residual_channels: 8,
            gate_channels: 16,
            skip_channels: 8,
            aux_channels: AUX as i32,
            aux_context_window: 1,
            upsample_scales: vec![4, 4],
            ..Default::default()
        },
        discriminator_params: DiscriminatorParams {
            layers: 3,
            conv_channels: 8,
            ..Default::default()
        },
        stft_loss_params: StftLossParams {
            fft_sizes: vec![64, 32],
            hop_sizes: vec![16, 8],
            win_lengths: vec![32, 16],
        },
        batch_size: 2,
        batch_max_steps: 8 * HOP,
        num_workers: 0,
        discriminator_train_start_steps: 2,
        train_max_steps: 4,
        save_interval_steps: 2,
        eval_interval_steps: 2,
        log_interval_steps: 1,
        num_snapshots: 2,
        ..Default::default()
    }
}

fn write_corpus(dir: &Path, name: &str, utterances: usize) -> std::path::PathBuf {
    let corpus = dir.join(name);
    std::fs::create_dir_all(&corpus).unwrap();
    let metadata = corpus.join("metadata.jsonl");
    let mut file = std::fs::File::create(&metadata).unwrap();
    for u in 0..utterances {
        let wave: Vec<f32> = (0..FRAMES * HOP)
            .map(|i| ((i as f32) * 0.05 * (u + 1) as f32).sin() * 0.3)
            .collect();
        let feats: Vec<f32> = (0..FRAMES * AUX)
            .map(|i| ((i % AUX) as f32) * 0.1 - (u as f32) * 0.05)
            .collect();
        let file_name = format!("utt{}.safetensors", u);
        WaveMelDataset::write_sample(corpus.join(&file_name), &wave, &feats, AUX).unwrap();
        writeln!(file, r#"{{"utt_id": "utt{}", "path": "{}"}}"#, u, file_name).unwrap();
    }
    metadata
}

fn paths(dir: &TempDir) -> PwgPaths {
    PwgPaths {
        train_metadata: write_corpus(dir.path(), "train", 4),
        dev_metadata: write_corpus(dir.path(), "dev", 2),
        output: dir.path().join("exp"),
    }
}

#[test]
#[serial]
fn test_train_gates_discriminator_and_snapshots() {
    let dir = TempDir::new().unwrap();
    let paths = paths(&dir);
    let config = tiny_config();

    train_pwg(&config, &paths, Arc::new(DistributedContext::local()), None).unwrap();

    let output = &paths.output;
    assert!(output.join("config.yaml").exists());
    assert!(output.join("checkpoints/snapshot_iter_2.safetensors").exists());
    assert!(output.join("checkpoints/snapshot_iter_4.safetensors").exists());
    assert!(output.join("checkpoints/snapshot_iter_4.opt.safetensors").exists());

    let records = read_scalars(output.join(VISUALIZER_FILE)).unwrap();
    let steps_with = |tag: &str| -> Vec<usize> {
        records.iter().filter(|r| r.tag == tag).map(|r| r.step).collect()
    };
    assert_eq!(steps_with("train/generator_loss"), vec![1, 2, 3, 4]);
    // Iteration 2 is the last generator-only step.
    assert_eq!(steps_with("train/discriminator_loss"), vec![4]);
    assert_eq!(steps_with("train/adversarial_loss"), vec![4]);
    assert_eq!(steps_with("eval/adversarial_loss"), vec![2, 4]);
    assert!(records.iter().all(|r| r.value.is_finite()));
}

#[test]
#[serial]
fn test_resume_continues_from_latest_snapshot() {
    let dir = TempDir::new().unwrap();
    let paths = paths(&dir);
    let mut config = tiny_config();

    train_pwg(&config, &paths, Arc::new(DistributedContext::local()), None).unwrap();

    config.train_max_steps = 6;
    train_pwg(&config, &paths, Arc::new(DistributedContext::local()), None).unwrap();

    let checkpoints = paths.output.join("checkpoints");
    assert!(checkpoints.join("snapshot_iter_6.safetensors").exists());
    assert!(checkpoints.join("snapshot_iter_4.safetensors").exists());
    assert!(!checkpoints.join("snapshot_iter_2.safetensors").exists());

    let records = read_scalars(paths.output.join(VISUALIZER_FILE)).unwrap();
    let generator_steps: Vec<usize> = records
        .iter()
        .filter(|r| r.tag == "train/generator_loss")
        .map(|r| r.step)
        .collect();
    assert_eq!(generator_steps, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
#[serial]
fn test_load_generator_from_any_checkpoint_file() {
    let dir = TempDir::new().unwrap();
    let paths = paths(&dir);
    let config = tiny_config();
    train_pwg(&config, &paths, Arc::new(DistributedContext::local()), None).unwrap();

    let checkpoints = paths.output.join("checkpoints");
    for name in [
        "snapshot_iter_4.opt.safetensors",
        "snapshot_iter_4.safetensors",
        "snapshot_iter_4.json",
    ] {
        let mut generator = load_generator(&config, &checkpoints.join(name)).unwrap();
        let mel = Array::from_slice(&[0.1f32; 3 * AUX], &[3, AUX as i32]);
        let wave = generator.inference(&mel).unwrap();
        assert_eq!(wave.shape(), &[(3 * HOP) as i32]);
    }
}

#[test]
#[serial]
fn test_synthesize_from_snapshot() {
    let dir = TempDir::new().unwrap();
    let paths = paths(&dir);
    let config = tiny_config();
    train_pwg(&config, &paths, Arc::new(DistributedContext::local()), None).unwrap();

    let out = dir.path().join("wavs");
    let n = synthesize(
        &config,
        &paths.output.join("checkpoints/snapshot_iter_4.safetensors"),
        &paths.dev_metadata,
        &out,
    )
    .unwrap();
    assert_eq!(n, 2);

    let tensors = Array::load_safetensors(out.join("utt0.safetensors")).unwrap();
    let wave = &tensors["wave"];
    assert_eq!(wave.shape(), &[(FRAMES * HOP) as i32]);
}

/// Yields the same batch forever.
struct Repeat(VocoderBatch);

impl BatchSource for Repeat {
    type Batch = VocoderBatch;

    fn next_batch(&mut self) -> Option<voxtrain_trainer::Result<VocoderBatch>> {
        Some(Ok(self.0.clone()))
    }

    fn set_epoch(&mut self, _epoch: usize) {}
}

#[test]
#[serial]
fn test_updater_message_order() {
    let config = tiny_config();
    let frames = 8 + 2;
    let batch = VocoderBatch {
        wave: mlx_rs::random::normal::<f32>(&[2, 1, (8 * HOP) as i32], None, None, None).unwrap(),
        mel: mlx_rs::random::normal::<f32>(&[2, AUX as i32, frames], None, None, None).unwrap(),
    };
    let generator = PwgGenerator::new(config.generator_params.clone()).unwrap();
    let discriminator = PwgDiscriminator::new(&config.discriminator_params).unwrap();
    let grad_sync = GradientSync::new(Arc::new(DistributedContext::local())).unwrap();
    let mut updater =
        PwgUpdater::new(Repeat(batch), generator, discriminator, &config, grad_sync).unwrap();

    for _ in 0..3 {
        updater.update().unwrap();
    }
    let msg = updater.msg().to_string();
    assert!(msg.starts_with("Rank: 0, spectral_convergence_loss: "));
    assert!(!msg.contains("real_loss"));

    updater.update().unwrap();
    let msg = updater.msg();
    let order = [
        "spectral_convergence_loss",
        "log_stft_magnitude_loss",
        "adversarial_loss",
        "generator_loss",
        "real_loss",
        "fake_loss",
        "discriminator_loss",
    ];
    let positions: Vec<usize> = order.iter().map(|k| msg.find(k).unwrap()).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(updater.state().iteration, 4);
}

/// Yields one batch per epoch.
struct Once(VocoderBatch, bool);

impl BatchSource for Once {
    type Batch = VocoderBatch;

    fn next_batch(&mut self) -> Option<voxtrain_trainer::Result<VocoderBatch>> {
        if self.1 {
            return None;
        }
        self.1 = true;
        Some(Ok(self.0.clone()))
    }

    fn set_epoch(&mut self, _epoch: usize) {
        self.1 = false;
    }
}

#[test]
#[serial]
fn test_dev_losses_are_repeatable() {
    let mut config = tiny_config();
    config.generator_params.dropout = 0.5;
    let batch = VocoderBatch {
        wave: mlx_rs::random::normal::<f32>(&[2, 1, (8 * HOP) as i32], None, None, None).unwrap(),
        mel: mlx_rs::random::normal::<f32>(&[2, AUX as i32, 10], None, None, None).unwrap(),
    };
    let generator = PwgGenerator::new(config.generator_params.clone()).unwrap();
    let discriminator = PwgDiscriminator::new(&config.discriminator_params).unwrap();
    let grad_sync = GradientSync::new(Arc::new(DistributedContext::local())).unwrap();
    let mut updater = PwgUpdater::new(
        Repeat(batch.clone()),
        generator,
        discriminator,
        &config,
        grad_sync,
    )
    .unwrap();
    let mut evaluator = PwgEvaluator::new(Once(batch, false), config.lambda_adv);

    let first = evaluator.evaluate(&mut updater).unwrap();
    let second = evaluator.evaluate(&mut updater).unwrap();
    assert_eq!(first, second);
    assert!(first.contains_key("eval/generator_loss"));
    assert!(updater
        .generator()
        .conv_layers
        .iter()
        .all(|block| block.dropout.training));
}
