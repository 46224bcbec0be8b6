//! Learning rate scheduler implementations.
//!
//! Two decay rules cover the voxtrain recipes:
//!
//! - [`ExponentialDecay`] is stepped once per epoch (punctuation training).
//! - [`StepDecay`] is stepped once per iteration (vocoder training).
//!
//! Both keep their own step counter so that a resumed run can fast-forward
//! with [`LrScheduler::set_step`] and land on the same learning rate.

use serde::{Deserialize, Serialize};

/// Common interface for learning rate schedules.
pub trait LrScheduler: Send {
    /// Learning rate for the given step.
    fn get_lr(&self, step: usize) -> f64;

    /// Current step counter.
    fn current_step(&self) -> usize;

    /// Move the step counter to `step`.
    fn set_step(&mut self, step: usize);

    /// Advance the scheduler by one step.
    fn step(&mut self) {
        let next = self.current_step() + 1;
        self.set_step(next);
    }

    /// Learning rate at the current step.
    fn current_lr(&self) -> f64 {
        self.get_lr(self.current_step())
    }
}

/// `lr = base_lr * gamma^step`.
#[derive(Debug, Clone)]
pub struct ExponentialDecay {
    base_lr: f64,
    gamma: f64,
    current_step: usize,
}

impl ExponentialDecay {
    /// Create a new exponential decay schedule.
    pub fn new(base_lr: f64, gamma: f64) -> Self {
        Self {
            base_lr,
            gamma,
            current_step: 0,
        }
    }
}

impl LrScheduler for ExponentialDecay {
    fn get_lr(&self, step: usize) -> f64 {
        self.base_lr * self.gamma.powi(step as i32)
    }

    fn current_step(&self) -> usize {
        self.current_step
    }

    fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }
}

/// `lr = base_lr * gamma^floor(step / step_size)`.
#[derive(Debug, Clone)]
pub struct StepDecay {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    current_step: usize,
}

impl StepDecay {
    /// Create a new step decay schedule.
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            current_step: 0,
        }
    }
}

impl LrScheduler for StepDecay {
    fn get_lr(&self, step: usize) -> f64 {
        let decays = (step / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    fn current_step(&self) -> usize {
        self.current_step
    }

    fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }
}

/// Constant learning rate.
#[derive(Debug, Clone)]
pub struct ConstantLr {
    lr: f64,
    current_step: usize,
}

impl ConstantLr {
    /// Create a constant schedule.
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            current_step: 0,
        }
    }
}

impl LrScheduler for ConstantLr {
    fn get_lr(&self, _step: usize) -> f64 {
        self.lr
    }

    fn current_step(&self) -> usize {
        self.current_step
    }

    fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }
}

/// Scheduler selection as it appears in config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerKind {
    /// See [`ConstantLr`].
    Constant {
        /// Learning rate.
        learning_rate: f64,
    },
    /// See [`ExponentialDecay`].
    ExponentialDecay {
        /// Initial learning rate.
        learning_rate: f64,
        /// Decay factor per step.
        gamma: f64,
    },
    /// See [`StepDecay`].
    StepDecay {
        /// Initial learning rate.
        learning_rate: f64,
        /// Steps between decays.
        step_size: usize,
        /// Decay factor.
        gamma: f64,
    },
}

impl SchedulerKind {
    /// Build a boxed scheduler.
    pub fn build(&self) -> Box<dyn LrScheduler> {
        match *self {
            Self::Constant { learning_rate } => Box::new(ConstantLr::new(learning_rate)),
            Self::ExponentialDecay {
                learning_rate,
                gamma,
            } => Box::new(ExponentialDecay::new(learning_rate, gamma)),
            Self::StepDecay {
                learning_rate,
                step_size,
                gamma,
            } => Box::new(StepDecay::new(learning_rate, step_size, gamma)),
        }
    }

    /// Learning rate before any step has been taken.
    pub fn initial_lr(&self) -> f64 {
        match *self {
            Self::Constant { learning_rate }
            | Self::ExponentialDecay { learning_rate, .. }
            | Self::StepDecay { learning_rate, .. } => learning_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_decay() {
        let mut scheduler = ExponentialDecay::new(1e-3, 0.5);
        assert!((scheduler.current_lr() - 1e-3).abs() < 1e-12);
        scheduler.step();
        assert!((scheduler.current_lr() - 5e-4).abs() < 1e-12);
        scheduler.step();
        assert!((scheduler.current_lr() - 2.5e-4).abs() < 1e-12);
    }

    #[test]
    fn test_exponential_decay_resume() {
        let mut fresh = ExponentialDecay::new(0.1, 0.9);
        for _ in 0..7 {
            fresh.step();
        }
        let mut resumed = ExponentialDecay::new(0.1, 0.9);
        resumed.set_step(7);
        assert!((fresh.current_lr() - resumed.current_lr()).abs() < 1e-15);
    }

    #[test]
    fn test_step_decay_boundaries() {
        let scheduler = StepDecay::new(1e-4, 200_000, 0.5);
        assert!((scheduler.get_lr(0) - 1e-4).abs() < 1e-15);
        assert!((scheduler.get_lr(199_999) - 1e-4).abs() < 1e-15);
        assert!((scheduler.get_lr(200_000) - 5e-5).abs() < 1e-15);
        assert!((scheduler.get_lr(400_000) - 2.5e-5).abs() < 1e-15);
    }

    #[test]
    fn test_step_size_zero_is_clamped() {
        let scheduler = StepDecay::new(1.0, 0, 0.5);
        assert!((scheduler.get_lr(2) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_scheduler_kind_from_yaml() {
        let kind: SchedulerKind =
            serde_yaml::from_str("type: step_decay\nlearning_rate: 0.0001\nstep_size: 10\ngamma: 0.5\n")
                .unwrap();
        assert!((kind.initial_lr() - 1e-4).abs() < 1e-15);
        let scheduler = kind.build();
        assert!((scheduler.get_lr(10) - 5e-5).abs() < 1e-15);
    }
}
