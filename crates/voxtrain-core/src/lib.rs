//! Core types, traits, and configuration for voxtrain.
//!
//! This crate provides the foundational pieces shared by the vocoder and
//! punctuation experiments:
//!
//! - Error handling infrastructure
//! - Serde configuration sections and YAML helpers
//! - Learning rate schedulers
//! - Scalar metric reporting scoped to a training step
//! - Dataset and callback traits

#![warn(missing_docs)]

mod config;
mod error;
pub mod reporter;
pub mod scheduler;
mod traits;

pub use config::*;
pub use error::*;
pub use reporter::{format_observation, report, Observation, Summary};
pub use scheduler::{ConstantLr, ExponentialDecay, LrScheduler, SchedulerKind, StepDecay};
pub use traits::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Result, VoxError};
    pub use crate::reporter::{report, Observation, Summary};
    pub use crate::scheduler::{LrScheduler, SchedulerKind};
    pub use crate::traits::*;
}
