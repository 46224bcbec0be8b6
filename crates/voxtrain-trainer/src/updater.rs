//! Updaters: one optimization step per call.

use std::collections::HashMap;
use std::time::Instant;

use mlx_rs::Array;
use serde::{Deserialize, Serialize};
use voxtrain_core::{Dataset, VoxError};
use voxtrain_data::{Collator, DataLoader};

use crate::checkpoint::Checkpoint;
use crate::error::Result;

/// Training progress counters.
///
/// Only the training loop mutates these. They are persisted in every
/// checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterState {
    /// Completed optimization steps.
    pub iteration: usize,
    /// Completed passes over the training set.
    pub epoch: usize,
}

/// Model and optimizer state to persist in a snapshot.
#[derive(Debug, Default)]
pub struct CheckpointPayload {
    /// Flattened model parameters.
    pub params: HashMap<String, Array>,
    /// Flattened optimizer state.
    pub optimizer: HashMap<String, Array>,
}

/// Something that can run one optimization step.
pub trait Updater {
    /// Read a batch, run one step and advance the iteration counter.
    fn update(&mut self) -> Result<()>;

    /// Progress counters.
    fn state(&self) -> &UpdaterState;

    /// Mutable progress counters.
    fn state_mut(&mut self) -> &mut UpdaterState;

    /// Human-readable summary of the last step.
    fn msg(&self) -> &str;

    /// Seconds the last step spent waiting for data.
    fn reader_secs(&self) -> f64 {
        0.0
    }

    /// Current learning rate, recorded in snapshots.
    fn learning_rate(&self) -> Option<f64> {
        None
    }

    /// State to persist in a snapshot.
    fn checkpoint_payload(&self) -> Result<CheckpointPayload>;

    /// Restore models, optimizers and counters from a checkpoint.
    fn restore(&mut self, checkpoint: &Checkpoint) -> Result<()>;
}

/// A stream of batches that is restarted once per epoch.
pub trait BatchSource {
    /// Batch type.
    type Batch;

    /// Next batch of the current epoch, or `None` at the end of it.
    fn next_batch(&mut self) -> Option<Result<Self::Batch>>;

    /// Start `epoch`.
    fn set_epoch(&mut self, epoch: usize);
}

impl<D, C> BatchSource for DataLoader<D, C>
where
    D: Dataset,
    C: Collator<D::Item>,
{
    type Batch = C::Batch;

    fn next_batch(&mut self) -> Option<Result<C::Batch>> {
        DataLoader::next_batch(self).map(|r| r.map_err(Into::into))
    }

    fn set_epoch(&mut self, epoch: usize) {
        DataLoader::set_epoch(self, epoch);
    }
}

/// Batch reading and counter bookkeeping shared by concrete updaters.
///
/// When the loader runs dry the epoch counter advances, the loader is moved
/// to the new epoch and reading continues.
#[derive(Debug)]
pub struct StandardUpdater<L> {
    loader: L,
    state: UpdaterState,
    reader_secs: f64,
}

impl<L: BatchSource> StandardUpdater<L> {
    /// Wrap a loader, starting at epoch 0 / iteration 0.
    pub fn new(mut loader: L) -> Self {
        loader.set_epoch(0);
        Self {
            loader,
            state: UpdaterState::default(),
            reader_secs: 0.0,
        }
    }

    /// Read the next batch, rolling over to the next epoch if needed.
    pub fn read_batch(&mut self) -> Result<L::Batch> {
        let start = Instant::now();
        let batch = match self.loader.next_batch() {
            Some(batch) => batch,
            None => {
                self.state.epoch += 1;
                self.loader.set_epoch(self.state.epoch);
                tracing::debug!(epoch = self.state.epoch, "Starting new epoch");
                self.loader
                    .next_batch()
                    .ok_or_else(|| VoxError::Data("training loader yielded no batches".into()))?
            }
        }?;
        self.reader_secs = start.elapsed().as_secs_f64();
        Ok(batch)
    }

    /// Mark one step as done.
    pub fn finish_step(&mut self) {
        self.state.iteration += 1;
    }

    /// Progress counters.
    pub fn state(&self) -> &UpdaterState {
        &self.state
    }

    /// Mutable progress counters.
    pub fn state_mut(&mut self) -> &mut UpdaterState {
        &mut self.state
    }

    /// Overwrite the counters and move the loader to the restored epoch.
    pub fn set_state(&mut self, state: UpdaterState) {
        self.state = state;
        self.loader.set_epoch(state.epoch);
    }

    /// Seconds spent in the last [`StandardUpdater::read_batch`].
    pub fn reader_secs(&self) -> f64 {
        self.reader_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields `per_epoch` batches tagged with the epoch they belong to.
    struct Counting {
        epoch: usize,
        left: usize,
        per_epoch: usize,
    }

    impl BatchSource for Counting {
        type Batch = usize;
        fn next_batch(&mut self) -> Option<Result<usize>> {
            if self.left == 0 {
                return None;
            }
            self.left -= 1;
            Some(Ok(self.epoch))
        }
        fn set_epoch(&mut self, epoch: usize) {
            self.epoch = epoch;
            self.left = self.per_epoch;
        }
    }

    #[test]
    fn test_epoch_rollover() {
        let mut updater = StandardUpdater::new(Counting {
            epoch: 0,
            left: 0,
            per_epoch: 2,
        });
        let seen: Vec<usize> = (0..5)
            .map(|_| {
                let b = updater.read_batch().unwrap();
                updater.finish_step();
                b
            })
            .collect();
        assert_eq!(seen, vec![0, 0, 1, 1, 2]);
        assert_eq!(updater.state().iteration, 5);
        assert_eq!(updater.state().epoch, 2);
    }

    #[test]
    fn test_empty_loader_is_an_error() {
        let mut updater = StandardUpdater::new(Counting {
            epoch: 0,
            left: 0,
            per_epoch: 0,
        });
        assert!(updater.read_batch().is_err());
    }

    #[test]
    fn test_set_state_moves_loader() {
        let mut updater = StandardUpdater::new(Counting {
            epoch: 0,
            left: 0,
            per_epoch: 1,
        });
        updater.set_state(UpdaterState {
            iteration: 10,
            epoch: 4,
        });
        assert_eq!(updater.read_batch().unwrap(), 4);
    }
}
