//! Experiment harness for voxtrain.
//!
//! This crate provides the pieces both model families train with:
//! - Checkpointing with k-best and latest-n retention
//! - Adam with L2 weight decay
//! - Gradient clipping and cross-rank gradient averaging
//! - Iteration-driven [`Trainer`] with evaluate / snapshot / visualize extensions
//! - Training callbacks
//! - Output directory scaffolding
//!
//! ```ignore
//! use voxtrain_trainer::{IntervalTrigger, Snapshot, Trainer};
//!
//! let mut trainer = Trainer::new(updater, 400_000).with_log_interval(100);
//! trainer.extend(Box::new(Snapshot::new(checkpointer)), IntervalTrigger::iterations(5000));
//! trainer.run()?;
//! ```

#![warn(missing_docs)]

pub mod callbacks;
pub mod checkpoint;
mod error;
pub mod evaluator;
pub mod experiment;
pub mod grad;
pub mod optimizer;
pub mod trainer;
pub mod trigger;
pub mod updater;
pub mod visualizer;

pub use callbacks::*;
pub use checkpoint::*;
pub use error::*;
pub use evaluator::*;
pub use experiment::*;
pub use grad::*;
pub use optimizer::*;
pub use trainer::*;
pub use trigger::*;
pub use updater::*;
pub use visualizer::*;
