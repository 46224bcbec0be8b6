//! Training and testing both taggers on a tiny synthetic corpus.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serial_test::serial;
use tempfile::TempDir;
use voxtrain_core::{CheckpointConfig, EpochTrainingConfig};
use voxtrain_distributed::DistributedContext;
use voxtrain_punc::{
    test_punc, train_punc, DataConfig, DataParams, DatasetType, LossType, ModelParams, ModelType,
    PuncConfig, PuncTestArgs, PuncTrainArgs,
};
use voxtrain_trainer::{read_scalars, CheckpointInfos, VISUALIZER_FILE};

// 6 words per repetition, 20 repetitions: 120 words, 24 rows of 5, 6 batches of 4.
const PATTERN: &str = "w1 w2 ， w3 w4 。 w5 w6 ？ ";
const BATCHES_PER_EPOCH: usize = 6;

fn write_corpus(dir: &Path) -> PuncConfig {
    let vocab: String = (0..10).map(|i| format!("w{}\n", i)).collect();
    std::fs::write(dir.join("vocab"), vocab).unwrap();
    std::fs::write(dir.join("punc_vocab"), "，\n。\n？\n").unwrap();
    let text = PATTERN.repeat(20);
    for split in ["train", "dev", "test"] {
        std::fs::write(dir.join(format!("{}.txt", split)), &text).unwrap();
    }

    PuncConfig {
        data: DataConfig {
            dataset_type: DatasetType::PuncCh,
            train_path: Some(dir.join("train.txt")),
            dev_path: Some(dir.join("dev.txt")),
            test_path: Some(dir.join("test.txt")),
            data_params: DataParams {
                vocab_file: dir.join("vocab"),
                punc_file: dir.join("punc_vocab"),
                seq_len: 5,
            },
            batch_size: 4,
            num_workers: 0,
            shuffle: false,
        },
        checkpoint: CheckpointConfig {
            kbest_n: 2,
            latest_n: 1,
        },
        model_type: ModelType::Blstm,
        model_params: ModelParams {
            vocab_size: 12,
            punc_size: 4,
            hidden_size: 8,
            embedding_size: Some(6),
            num_layers: 1,
            init_scale: 0.1,
            dropout: 0.0,
        },
        loss_type: LossType::Ce,
        training: EpochTrainingConfig {
            n_epoch: 2,
            lr: 0.01,
            lr_decay: 0.5,
            log_interval: 2,
            ..Default::default()
        },
        testing: Default::default(),
    }
}

fn local() -> Arc<DistributedContext> {
    Arc::new(DistributedContext::local())
}

fn read_infos(path: &Path) -> CheckpointInfos {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
#[serial]
fn test_train_checkpoints_every_epoch() {
    let dir = TempDir::new().unwrap();
    let config = write_corpus(dir.path());
    let output = dir.path().join("exp");
    let args = PuncTrainArgs {
        output: output.clone(),
        checkpoint_path: None,
    };

    train_punc(&config, &args, local(), None).unwrap();

    let checkpoints = output.join("checkpoints");
    assert!(output.join("config.yaml").exists());
    assert!(checkpoints.join("0.safetensors").exists());
    assert!(checkpoints.join("1.safetensors").exists());
    assert!(checkpoints.join("1.opt.safetensors").exists());
    // "init" carries no val_loss and falls out of the latest-1 record.
    assert!(!checkpoints.join("init.safetensors").exists());

    let infos = read_infos(&checkpoints.join("1.json"));
    assert_eq!(infos.epoch, 1);
    assert_eq!(infos.step, 2 * BATCHES_PER_EPOCH);
    assert!(infos.val_loss.is_some_and(f64::is_finite));
    assert!(infos.f1.is_some());
    assert!((infos.lr - 0.005).abs() < 1e-6);

    let records = read_scalars(output.join(VISUALIZER_FILE)).unwrap();
    let train_steps: Vec<usize> = records
        .iter()
        .filter(|r| r.tag == "train/train_loss")
        .map(|r| r.step)
        .collect();
    assert_eq!(train_steps, (0..2 * BATCHES_PER_EPOCH).collect::<Vec<_>>());
    let lrs: Vec<f64> = records
        .iter()
        .filter(|r| r.tag == "eval/lr")
        .map(|r| r.value)
        .collect();
    assert_eq!(lrs.len(), 2);
    assert!((lrs[0] - 0.01).abs() < 1e-9);
    assert!((lrs[1] - 0.005).abs() < 1e-9);
}

#[test]
#[serial]
fn test_resume_continues_epochs() {
    let dir = TempDir::new().unwrap();
    let mut config = write_corpus(dir.path());
    config.model_type = ModelType::Lstm;
    let output = dir.path().join("exp");
    let args = PuncTrainArgs {
        output: output.clone(),
        checkpoint_path: None,
    };

    train_punc(&config, &args, local(), None).unwrap();
    config.training.n_epoch = 3;
    train_punc(&config, &args, local(), None).unwrap();

    let records = read_scalars(output.join(VISUALIZER_FILE)).unwrap();
    let epochs: Vec<usize> = records
        .iter()
        .filter(|r| r.tag == "eval/cv_loss")
        .map(|r| r.step)
        .collect();
    // The restored epoch-1 checkpoint records the epoch it finished, so that
    // epoch runs again.
    assert_eq!(epochs, vec![0, 1, 1, 2]);
    let last_step = records
        .iter()
        .filter(|r| r.tag == "train/train_loss")
        .map(|r| r.step)
        .max()
        .unwrap();
    assert_eq!(last_step, 4 * BATCHES_PER_EPOCH - 1);

    let infos = read_infos(&output.join("checkpoints/2.json"));
    assert_eq!(infos.step, 4 * BATCHES_PER_EPOCH);
    assert_eq!(infos.epoch, 2);
}

#[test]
#[serial]
fn test_stop_flag_saves_interrupt_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = write_corpus(dir.path());
    let output = dir.path().join("exp");
    let args = PuncTrainArgs {
        output: output.clone(),
        checkpoint_path: None,
    };

    let stop = Arc::new(AtomicBool::new(true));
    let err = train_punc(&config, &args, local(), Some(stop)).unwrap_err();
    assert!(err.is_interrupted());

    let infos = read_infos(&output.join("checkpoints/0.json"));
    assert_eq!(infos.step, 0);
    assert!(infos.val_loss.is_none());
}

#[test]
#[serial]
fn test_scores_trained_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = write_corpus(dir.path());
    let output = dir.path().join("exp");
    let args = PuncTrainArgs {
        output: output.clone(),
        checkpoint_path: None,
    };
    train_punc(&config, &args, local(), None).unwrap();

    let result_file = dir.path().join("result.txt");
    let test_args = PuncTestArgs {
        output: None,
        checkpoint_path: output.join("checkpoints/1.safetensors"),
        result_file: Some(result_file.clone()),
    };
    let result = test_punc(&config, &test_args, local()).unwrap().unwrap();

    assert_eq!(result.report.macro_avg.support, 120);
    assert_eq!(result.evaluation.columns.len(), 3);
    let text = std::fs::read_to_string(result_file).unwrap();
    assert!(text.starts_with("Test: epoch: 1, step: 12\n"));
    assert!(text.ends_with(&result.to_string()));
    assert!(text.contains("OVERALL"));
    assert!(text.contains("weighted avg"));
}

#[test]
#[serial]
fn test_vocabulary_larger_than_model_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = write_corpus(dir.path());
    config.model_params.vocab_size = 5;
    let args = PuncTrainArgs {
        output: dir.path().join("exp"),
        checkpoint_path: None,
    };
    let err = train_punc(&config, &args, local(), None).unwrap_err();
    assert!(err.to_string().contains("vocab_size"));
}
