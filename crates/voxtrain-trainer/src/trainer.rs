//! Iteration-driven training loop with pluggable extensions.
//!
//! [`Trainer::run`] calls [`Updater::update`] until `max_iteration` is
//! reached. After every step each registered [`Extension`] whose
//! [`IntervalTrigger`] fires is invoked with the step's observation, in
//! registration order. Register [`Evaluate`] before [`Visualize`] so
//! evaluation metrics reach the scalar log.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use voxtrain_core::{reporter, Observation, TrainingCallback, VoxError};

use crate::callbacks::CompositeCallback;
use crate::checkpoint::{CheckpointInfos, Checkpointer};
use crate::error::Result;
use crate::evaluator::Evaluator;
use crate::trigger::IntervalTrigger;
use crate::updater::Updater;
use crate::visualizer::Visualizer;

/// Hook run by the [`Trainer`] when its trigger fires.
pub trait Extension<U> {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called once before the first step, on every rank.
    fn initialize(&mut self, _updater: &mut U) -> Result<()> {
        Ok(())
    }

    /// Called after a step when the trigger fires.
    fn call(&mut self, updater: &mut U, observation: &mut Observation) -> Result<()>;

    /// Called when training is interrupted, before the trainer returns.
    fn on_interrupt(&mut self, _updater: &mut U) -> Result<()> {
        Ok(())
    }

    /// Called once after the last step.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether [`Extension::call`] runs on rank 0 only.
    fn master_only(&self) -> bool {
        true
    }
}

/// Merges dev-set means into the step observation.
pub struct Evaluate<E> {
    evaluator: E,
}

impl<E> Evaluate<E> {
    /// Wrap an evaluator.
    pub fn new(evaluator: E) -> Self {
        Self { evaluator }
    }
}

impl<U, E: Evaluator<U>> Extension<U> for Evaluate<E> {
    fn name(&self) -> &str {
        "evaluate"
    }

    fn call(&mut self, updater: &mut U, observation: &mut Observation) -> Result<()> {
        let means = self.evaluator.evaluate(updater)?;
        observation.extend(means);
        Ok(())
    }
}

/// Saves `snapshot_iter_{n}` checkpoints and resumes from the latest one.
pub struct Snapshot {
    checkpointer: Checkpointer,
}

impl Snapshot {
    /// Prefix of every snapshot tag.
    pub const TAG_PREFIX: &'static str = "snapshot_iter_";

    /// Use `checkpointer` for storage. Its `latest_n` is the number of
    /// snapshots kept.
    pub fn new(checkpointer: Checkpointer) -> Self {
        Self { checkpointer }
    }

    /// Tag used for a snapshot taken at `iteration`.
    pub fn tag(iteration: usize) -> String {
        format!("{}{}", Self::TAG_PREFIX, iteration)
    }

    fn save<U: Updater>(&mut self, updater: &U, tag: &str) -> Result<PathBuf> {
        let payload = updater.checkpoint_payload()?;
        let state = updater.state();
        let infos = CheckpointInfos {
            step: state.iteration,
            epoch: state.epoch,
            lr: updater.learning_rate().unwrap_or_default(),
            ..Default::default()
        };
        let path = self
            .checkpointer
            .add_checkpoint(tag, &payload.params, &payload.optimizer, &infos)?;
        tracing::info!(path = %path.display(), iteration = state.iteration, "Saved snapshot");
        Ok(path)
    }
}

impl<U: Updater> Extension<U> for Snapshot {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn initialize(&mut self, updater: &mut U) -> Result<()> {
        if let Some(checkpoint) = self.checkpointer.load_parameters(None)? {
            updater.restore(&checkpoint)?;
            tracing::info!(
                tag = %checkpoint.tag,
                iteration = updater.state().iteration,
                epoch = updater.state().epoch,
                "Resumed from snapshot"
            );
        }
        Ok(())
    }

    fn call(&mut self, updater: &mut U, _observation: &mut Observation) -> Result<()> {
        let tag = Self::tag(updater.state().iteration);
        self.save(updater, &tag)?;
        Ok(())
    }

    fn on_interrupt(&mut self, updater: &mut U) -> Result<()> {
        let tag = Self::tag(updater.state().iteration);
        self.save(updater, &tag)?;
        Ok(())
    }
}

/// Writes every observation to the scalar log.
pub struct Visualize {
    visualizer: Visualizer,
}

impl Visualize {
    /// Wrap a visualizer.
    pub fn new(visualizer: Visualizer) -> Self {
        Self { visualizer }
    }
}

impl<U: Updater> Extension<U> for Visualize {
    fn name(&self) -> &str {
        "visualize"
    }

    fn call(&mut self, updater: &mut U, observation: &mut Observation) -> Result<()> {
        self.visualizer
            .add_scalars(observation, updater.state().iteration)
    }

    fn finalize(&mut self) -> Result<()> {
        self.visualizer.close()
    }
}

struct Registered<U> {
    extension: Box<dyn Extension<U>>,
    trigger: IntervalTrigger,
}

/// Drives an [`Updater`] to `max_iteration`.
pub struct Trainer<U> {
    updater: U,
    max_iteration: usize,
    extensions: Vec<Registered<U>>,
    callbacks: CompositeCallback,
    log_interval: usize,
    is_master: bool,
    stop: Option<Arc<AtomicBool>>,
}

impl<U: Updater> Trainer<U> {
    /// Create a trainer that stops once `iteration >= max_iteration`.
    pub fn new(updater: U, max_iteration: usize) -> Self {
        Self {
            updater,
            max_iteration,
            extensions: Vec::new(),
            callbacks: CompositeCallback::new(),
            log_interval: 100,
            is_master: true,
            stop: None,
        }
    }

    /// Log the updater message every `interval` iterations (0 disables).
    pub fn with_log_interval(mut self, interval: usize) -> Self {
        self.log_interval = interval;
        self
    }

    /// Whether this process is rank 0.
    pub fn with_master(mut self, is_master: bool) -> Self {
        self.is_master = is_master;
        self
    }

    /// Flag that requests a graceful stop when set.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Register an extension.
    pub fn extend(&mut self, extension: Box<dyn Extension<U>>, trigger: IntervalTrigger) {
        tracing::debug!(name = extension.name(), "Registered extension");
        self.extensions.push(Registered { extension, trigger });
    }

    /// Register a callback.
    pub fn add_callback(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.add(callback);
    }

    /// The wrapped updater.
    pub fn updater(&self) -> &U {
        &self.updater
    }

    /// Consume the trainer, returning the updater.
    pub fn into_updater(self) -> U {
        self.updater
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Run until `max_iteration`.
    ///
    /// Returns [`VoxError::Interrupted`] after saving when the stop flag is set.
    pub fn run(&mut self) -> Result<()> {
        for registered in &mut self.extensions {
            registered.extension.initialize(&mut self.updater)?;
        }

        let start_iteration = self.updater.state().iteration;
        tracing::info!(
            start_iteration,
            max_iteration = self.max_iteration,
            "Starting training"
        );
        self.callbacks.on_train_start();

        let result = self.run_loop();

        for registered in &mut self.extensions {
            registered.extension.finalize()?;
        }
        if result.is_ok() {
            self.callbacks.on_train_end();
            tracing::info!(iteration = self.updater.state().iteration, "Training Done.");
        }
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        let mut last_epoch = self.updater.state().epoch;
        self.callbacks.on_epoch_start(last_epoch);

        let mut reader_cost = 0.0;
        let mut batch_cost = 0.0;
        let mut window = 0usize;

        while self.updater.state().iteration < self.max_iteration {
            if self.stop_requested() {
                return Err(self.interrupt());
            }

            let start = Instant::now();
            let mut observation = Observation::new();
            let updater = &mut self.updater;
            reporter::scope(&mut observation, || updater.update())?;
            batch_cost += start.elapsed().as_secs_f64();
            reader_cost += self.updater.reader_secs();
            window += 1;

            let state = *self.updater.state();
            if state.epoch != last_epoch {
                last_epoch = state.epoch;
                self.callbacks.on_epoch_start(state.epoch);
            }

            for registered in &mut self.extensions {
                if registered.extension.master_only() && !self.is_master {
                    continue;
                }
                if registered.trigger.fire(&state) {
                    registered
                        .extension
                        .call(&mut self.updater, &mut observation)?;
                }
            }

            if self.log_interval > 0 && state.iteration % self.log_interval == 0 {
                tracing::info!(
                    "iter: {}, {}, avg_reader_cost: {:.5} sec, avg_batch_cost: {:.5} sec",
                    state.iteration,
                    self.updater.msg(),
                    reader_cost / window as f64,
                    batch_cost / window as f64
                );
                reader_cost = 0.0;
                batch_cost = 0.0;
                window = 0;
            }

            self.callbacks.on_step_end(state.iteration, &observation);
        }
        Ok(())
    }

    fn interrupt(&mut self) -> crate::error::TrainerError {
        let step = self.updater.state().iteration;
        tracing::warn!(step, "Stop requested");
        if self.is_master {
            for registered in &mut self.extensions {
                if let Err(e) = registered.extension.on_interrupt(&mut self.updater) {
                    tracing::error!(
                        name = registered.extension.name(),
                        error = %e,
                        "Interrupt hook failed"
                    );
                }
            }
        }
        VoxError::Interrupted { step }.into()
    }
}
