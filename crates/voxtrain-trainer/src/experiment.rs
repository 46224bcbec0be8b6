//! Output directory layout shared by all experiments.
//!
//! ```text
//! {output}/
//!   config.yaml
//!   visualizer.jsonl
//!   worker_{rank}.log
//!   checkpoints/
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use voxtrain_core::{dump_yaml, CheckpointConfig};
use voxtrain_distributed::DistributedContext;

use crate::checkpoint::Checkpointer;
use crate::error::Result;
use crate::visualizer::Visualizer;

/// Per-rank log file inside the output directory.
pub fn worker_log_path(output: impl AsRef<Path>, rank: usize) -> PathBuf {
    output.as_ref().join(format!("worker_{}.log", rank))
}

/// An initialised output directory.
pub struct Experiment {
    output: PathBuf,
    checkpointer: Checkpointer,
    visualizer: Option<Visualizer>,
    ctx: Arc<DistributedContext>,
}

impl Experiment {
    /// Name of the dumped configuration.
    pub const CONFIG_FILE: &'static str = "config.yaml";

    /// Prepare `output` for a run.
    ///
    /// Rank 0 dumps the configuration and opens the visualizer; every rank
    /// gets a checkpointer over `{output}/checkpoints`.
    pub fn setup<C: Serialize>(
        output: impl AsRef<Path>,
        config: &C,
        checkpoint: &CheckpointConfig,
        ctx: Arc<DistributedContext>,
    ) -> Result<Self> {
        let output = output.as_ref().to_path_buf();
        std::fs::create_dir_all(&output)?;

        let visualizer = if ctx.is_master() {
            dump_yaml(config, output.join(Self::CONFIG_FILE))?;
            Some(Visualizer::new(&output)?)
        } else {
            None
        };

        let checkpointer = Checkpointer::new(
            output.join("checkpoints"),
            checkpoint.kbest_n,
            checkpoint.latest_n,
        )?;

        tracing::info!(
            output = %output.display(),
            rank = ctx.rank(),
            world_size = ctx.world_size(),
            "Experiment initialised"
        );

        Ok(Self {
            output,
            checkpointer,
            visualizer,
            ctx,
        })
    }

    /// Output directory.
    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    /// Checkpoint directory.
    pub fn checkpoint_dir(&self) -> &Path {
        self.checkpointer.dir()
    }

    /// Checkpoint manager.
    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    /// Mutable checkpoint manager.
    pub fn checkpointer_mut(&mut self) -> &mut Checkpointer {
        &mut self.checkpointer
    }

    /// Scalar log, present on rank 0 only.
    pub fn visualizer_mut(&mut self) -> Option<&mut Visualizer> {
        self.visualizer.as_mut()
    }

    /// Distributed context.
    pub fn context(&self) -> &Arc<DistributedContext> {
        &self.ctx
    }

    /// Whether this is rank 0.
    pub fn is_master(&self) -> bool {
        self.ctx.is_master()
    }

    /// Split into the checkpointer and visualizer for use as extensions.
    pub fn into_parts(self) -> (Checkpointer, Option<Visualizer>) {
        (self.checkpointer, self.visualizer)
    }
}
