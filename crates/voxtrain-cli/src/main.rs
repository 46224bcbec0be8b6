//! voxtrain CLI - vocoder and punctuation training on MLX.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::prelude::*;
use voxtrain_core::{dump_yaml, load_yaml};
use voxtrain_distributed::{DistributedConfig, DistributedContext, RingBackend};
use voxtrain_punc::{test_punc, train_punc, PuncConfig, PuncTestArgs, PuncTrainArgs};
use voxtrain_trainer::worker_log_path;
use voxtrain_vocoder::{synthesize, train_pwg, PwgConfig, PwgPaths};

#[derive(Parser)]
#[command(name = "voxtrain")]
#[command(author, version, about = "Speech model training on MLX", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Which recipe `sample-config` writes.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConfigKind {
    /// Parallel WaveGAN vocoder.
    Vocoder,
    /// RNN punctuation restoration.
    Punc,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a Parallel WaveGAN vocoder
    TrainVocoder {
        /// Path to the recipe (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// metadata.jsonl of the training set
        #[arg(long)]
        train_metadata: PathBuf,

        /// metadata.jsonl of the dev set
        #[arg(long)]
        dev_metadata: PathBuf,

        /// Experiment output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Comma-separated `ip:port` of every rank (defaults to VOXTRAIN_NODES)
        #[arg(long)]
        nodes: Option<String>,

        /// This process's rank (defaults to VOXTRAIN_RANK)
        #[arg(long)]
        rank: Option<usize>,
    },

    /// Train a punctuation tagger
    TrainPunc {
        /// Path to the recipe (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Experiment output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Checkpoint to start from instead of the latest one
        #[arg(long)]
        checkpoint_path: Option<PathBuf>,
    },

    /// Score a punctuation checkpoint on the test split
    TestPunc {
        /// Path to the recipe (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Output directory (defaults to the checkpoint's experiment directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Checkpoint to score
        #[arg(long)]
        checkpoint_path: PathBuf,

        /// Also write the report to this file
        #[arg(long)]
        result_file: Option<PathBuf>,
    },

    /// Generate waveforms from mel features with a trained generator
    Synthesize {
        /// Path to the recipe (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Training snapshot holding the generator
        #[arg(long)]
        checkpoint_path: PathBuf,

        /// metadata.jsonl listing the features to vocode
        #[arg(long)]
        metadata: PathBuf,

        /// Directory for the generated waves
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Write a default recipe
    SampleConfig {
        /// Recipe kind
        #[arg(long, value_enum)]
        kind: ConfigKind,

        /// Where to write the YAML
        #[arg(short, long)]
        output: PathBuf,
    },
}

/// Console logging, plus a plain-text copy in `log_file` when given.
fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

/// Cluster layout from the flags, falling back to the environment.
fn distributed_config(
    nodes: Option<&str>,
    rank: Option<usize>,
) -> anyhow::Result<Option<DistributedConfig>> {
    match nodes {
        Some(nodes) => {
            let rank = rank.unwrap_or(0).to_string();
            DistributedConfig::parse(nodes, &rank).map(Some)
        }
        None => {
            let mut config = DistributedConfig::from_env()?;
            if let (Some(config), Some(rank)) = (config.as_mut(), rank) {
                config.rank = rank;
                config.validate()?;
            }
            Ok(config)
        }
    }
}

async fn connect(config: Option<DistributedConfig>) -> anyhow::Result<Arc<DistributedContext>> {
    let ctx = match config {
        Some(config) if config.world_size() > 1 => {
            tracing::info!(
                rank = config.rank,
                world_size = config.world_size(),
                "Joining training ring"
            );
            DistributedContext::new(Box::new(RingBackend::new(config).await?))
        }
        _ => DistributedContext::local(),
    };
    Ok(Arc::new(ctx))
}

/// Flag set on Ctrl-C; training loops save and stop when they see it.
fn stop_on_ctrl_c() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, stopping after the current step");
            flag.store(true, Ordering::SeqCst);
        }
    });
    stop
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::TrainVocoder {
            config,
            train_metadata,
            dev_metadata,
            output,
            nodes,
            rank,
        } => {
            let dist = distributed_config(nodes.as_deref(), rank)?;
            let rank = dist.as_ref().map_or(0, |c| c.rank);
            init_logging(Some(&worker_log_path(&output, rank)))?;

            let recipe: PwgConfig = load_yaml(&config)
                .with_context(|| format!("failed to load {}", config.display()))?;
            let ctx = connect(dist).await?;
            let paths = PwgPaths {
                train_metadata,
                dev_metadata,
                output,
            };
            train_pwg(&recipe, &paths, ctx, Some(stop_on_ctrl_c()))?;
        }

        Commands::TrainPunc {
            config,
            output,
            checkpoint_path,
        } => {
            let recipe: PuncConfig = load_yaml(&config)
                .with_context(|| format!("failed to load {}", config.display()))?;
            let dist = distributed_config(None, None)?;
            let rank = dist.as_ref().map_or(0, |c| c.rank);
            let log_file = match &recipe.training.log_path {
                Some(path) => PathBuf::from(path),
                None => worker_log_path(&output, rank),
            };
            init_logging(Some(&log_file))?;

            let ctx = connect(dist).await?;
            let args = PuncTrainArgs {
                output,
                checkpoint_path,
            };
            train_punc(&recipe, &args, ctx, Some(stop_on_ctrl_c()))?;
        }

        Commands::TestPunc {
            config,
            output,
            checkpoint_path,
            result_file,
        } => {
            let recipe: PuncConfig = load_yaml(&config)
                .with_context(|| format!("failed to load {}", config.display()))?;
            let log_file = recipe.testing.log_path.as_ref().map(PathBuf::from);
            init_logging(log_file.as_deref())?;

            let args = PuncTestArgs {
                output,
                checkpoint_path,
                result_file,
            };
            if let Some(result) = test_punc(&recipe, &args, Arc::new(DistributedContext::local()))? {
                println!("{}", result);
            }
        }

        Commands::Synthesize {
            config,
            checkpoint_path,
            metadata,
            output,
        } => {
            init_logging(None)?;
            let recipe: PwgConfig = load_yaml(&config)
                .with_context(|| format!("failed to load {}", config.display()))?;
            let count = synthesize(&recipe, &checkpoint_path, &metadata, &output)?;
            println!("Synthesized {} utterances into {}", count, output.display());
        }

        Commands::SampleConfig { kind, output } => {
            init_logging(None)?;
            match kind {
                ConfigKind::Vocoder => dump_yaml(&PwgConfig::default(), &output)?,
                ConfigKind::Punc => dump_yaml(&PuncConfig::sample(), &output)?,
            }
            println!("Wrote {:?} config to {}", kind, output.display());
        }
    }

    Ok(())
}
