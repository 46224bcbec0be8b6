//! Forward-only passes over a dev set.

use voxtrain_core::{reporter, Observation, Summary};

use crate::error::Result;
use crate::updater::BatchSource;

/// Runs a model of `T` over a dev loader and averages what it reports.
///
/// `T` is whatever owns the models, usually the updater.
pub trait Evaluator<T> {
    /// Dev loader type.
    type Loader: BatchSource;

    /// The dev loader.
    fn loader_mut(&mut self) -> &mut Self::Loader;

    /// Evaluate one batch, calling [`reporter::report`] for every metric.
    fn evaluate_core(
        &mut self,
        target: &mut T,
        batch: <Self::Loader as BatchSource>::Batch,
    ) -> Result<()>;

    /// Switch the models of `target` between training and inference mode.
    fn set_training(&mut self, _target: &mut T, _training: bool) {}

    /// One full pass over the dev loader; returns the per-key means.
    ///
    /// The target is in inference mode for the pass and back in training
    /// mode afterwards, also when the pass fails.
    fn evaluate(&mut self, target: &mut T) -> Result<Observation> {
        self.set_training(target, false);
        let means = (|| -> Result<Observation> {
            self.loader_mut().set_epoch(0);
            let mut summary = Summary::new();
            while let Some(batch) = self.loader_mut().next_batch() {
                let batch = batch?;
                let mut observation = Observation::new();
                reporter::scope(&mut observation, || self.evaluate_core(target, batch))?;
                summary.add(&observation);
            }
            Ok(summary.compute_mean())
        })();
        self.set_training(target, true);
        means
    }
}
