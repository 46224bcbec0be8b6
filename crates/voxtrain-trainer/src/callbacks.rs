//! Hooks that observe a training run without driving it.
//!
//! Trainers own a [`CompositeCallback`] and fire it at step, epoch and
//! checkpoint boundaries. [`LoggingCallback`] mirrors the reported scalars
//! into the log; [`ProgressCallback`] draws a terminal bar.

use std::path::Path;

use voxtrain_core::{format_observation, EvalMetrics, Observation, TrainingCallback};

/// Terminal progress bar keyed on the global step.
pub struct ProgressCallback {
    progress: indicatif::ProgressBar,
}

impl ProgressCallback {
    /// Create a new progress callback.
    pub fn new(total_steps: usize) -> Self {
        let progress = indicatif::ProgressBar::new(total_steps as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        {
            progress.set_style(style.progress_chars("#>-"));
        }
        Self { progress }
    }

    /// Start the bar at `step`, for resumed runs.
    pub fn with_position(self, step: usize) -> Self {
        self.progress.set_position(step as u64);
        self
    }
}

impl TrainingCallback for ProgressCallback {
    fn on_train_end(&mut self) {
        self.progress.finish_with_message("Training complete!");
    }

    fn on_epoch_start(&mut self, epoch: usize) {
        self.progress.set_message(format!("epoch {}", epoch));
    }

    fn on_step_end(&mut self, step: usize, observation: &Observation) {
        self.progress.set_position(step as u64);
        if let Some((name, value)) = observation.iter().find(|(k, _)| k.ends_with("loss")) {
            self.progress.set_message(format!("{}: {:.4}", name, value));
        }
    }
}

/// Logs the step observation every `log_every` steps and a line per epoch.
pub struct LoggingCallback {
    log_every: usize,
}

impl LoggingCallback {
    /// Create a new logging callback.
    pub fn new(log_every: usize) -> Self {
        Self {
            log_every: log_every.max(1),
        }
    }
}

impl TrainingCallback for LoggingCallback {
    fn on_step_end(&mut self, step: usize, observation: &Observation) {
        if step % self.log_every == 0 {
            tracing::info!(step, "{}", format_observation(observation));
        }
    }

    fn on_epoch_end(&mut self, epoch: usize, metrics: &EvalMetrics) {
        tracing::info!(
            epoch,
            loss = metrics.loss,
            f1 = metrics.f1,
            "Epoch complete"
        );
    }

    fn on_save(&mut self, path: &Path) {
        tracing::debug!(path = %path.display(), "Checkpoint written");
    }
}

/// Fans every event out to a list of callbacks, in insertion order.
#[derive(Default)]
pub struct CompositeCallback {
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl CompositeCallback {
    /// Empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback.
    pub fn add(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.push(callback);
    }

    /// Number of callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Whether no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    fn each(&mut self, mut event: impl FnMut(&mut dyn TrainingCallback)) {
        self.callbacks.iter_mut().for_each(|cb| event(cb.as_mut()));
    }
}

impl TrainingCallback for CompositeCallback {
    fn on_train_start(&mut self) {
        self.each(|cb| cb.on_train_start());
    }

    fn on_train_end(&mut self) {
        self.each(|cb| cb.on_train_end());
    }

    fn on_epoch_start(&mut self, epoch: usize) {
        self.each(|cb| cb.on_epoch_start(epoch));
    }

    fn on_epoch_end(&mut self, epoch: usize, metrics: &EvalMetrics) {
        self.each(|cb| cb.on_epoch_end(epoch, metrics));
    }

    fn on_step_end(&mut self, step: usize, observation: &Observation) {
        self.each(|cb| cb.on_step_end(step, observation));
    }

    fn on_save(&mut self, path: &Path) {
        self.each(|cb| cb.on_save(path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder(Rc<RefCell<Vec<String>>>);

    impl TrainingCallback for Recorder {
        fn on_train_start(&mut self) {
            self.0.borrow_mut().push("start".into());
        }
        fn on_step_end(&mut self, step: usize, _observation: &Observation) {
            self.0.borrow_mut().push(format!("step {}", step));
        }
        fn on_train_end(&mut self) {
            self.0.borrow_mut().push("end".into());
        }
    }

    #[test]
    fn test_composite_forwards_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut composite = CompositeCallback::new();
        composite.add(Box::new(Recorder(log.clone())));
        composite.add(Box::new(LoggingCallback::new(1)));
        assert_eq!(composite.len(), 2);

        composite.on_train_start();
        composite.on_step_end(1, &Observation::new());
        composite.on_train_end();
        assert_eq!(*log.borrow(), vec!["start", "step 1", "end"]);
    }

    #[test]
    fn test_progress_callback_tracks_steps() {
        let mut progress = ProgressCallback::new(10).with_position(2);
        let mut obs = Observation::new();
        obs.insert("train/loss".into(), 0.5);
        progress.on_step_end(3, &obs);
        assert_eq!(progress.progress.position(), 3);
        progress.on_train_end();
    }
}
