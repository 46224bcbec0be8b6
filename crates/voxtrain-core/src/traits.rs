//! Seams between datasets, trainers and observers.

use crate::Observation;
use std::path::Path;

/// Indexable collection of examples.
///
/// Loaders only ever ask for a length and for items by position, so a
/// dataset may hold everything in memory or read lazily from disk.
pub trait Dataset: Send + Sync {
    /// One example.
    type Item;

    /// Example count.
    fn len(&self) -> usize;

    /// Whether there are no examples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Example at `index`, or `None` past the end.
    fn get(&self, index: usize) -> Option<Self::Item>;
}

/// Summary of one validation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalMetrics {
    /// Mean loss over the dev set.
    pub loss: f64,
    /// Macro F1, for classifiers.
    pub f1: Option<f64>,
}

/// Observer of a training run. Every hook defaults to a no-op.
pub trait TrainingCallback {
    /// Before the first step.
    fn on_train_start(&mut self) {}

    /// After a run that finished without error.
    fn on_train_end(&mut self) {}

    /// Before the first batch of `epoch`.
    fn on_epoch_start(&mut self, _epoch: usize) {}

    /// After `epoch` has been validated.
    fn on_epoch_end(&mut self, _epoch: usize, _metrics: &EvalMetrics) {}

    /// After the update of `step`, with everything reported during it.
    fn on_step_end(&mut self, _step: usize, _observation: &Observation) {}

    /// After a checkpoint has been written to `path`.
    fn on_save(&mut self, _path: &Path) {}
}
