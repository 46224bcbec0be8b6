//! RNN punctuation restoration on MLX.
//!
//! Each word of an unpunctuated transcript is tagged with the punctuation
//! mark that should follow it. Two taggers are available: a unidirectional
//! LSTM ([`RnnLm`]) and a bidirectional one ([`BiLstm`]). Training is
//! epoch-driven with exponential learning-rate decay, and every epoch is
//! checkpointed with its validation loss and macro F1.
//!
//! ```ignore
//! use std::sync::Arc;
//! use voxtrain_distributed::DistributedContext;
//! use voxtrain_punc::{train_punc, PuncConfig, PuncTrainArgs};
//!
//! let config: PuncConfig = voxtrain_core::load_yaml("conf/blstm.yaml")?;
//! let args = PuncTrainArgs { output: "exp/punc".into(), checkpoint_path: None };
//! train_punc(&config, &args, Arc::new(DistributedContext::local()), None)?;
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod experiment;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod nn;
pub mod tester;
pub mod trainer;

pub use config::*;
pub use error::*;
pub use experiment::{test_punc, train_punc};
pub use loss::{cross_entropy, lm_cross_entropy};
pub use metrics::{class_scores, evaluation, f1_macro, ClassScores, ClassificationReport, PuncEvaluation};
pub use model::{BiLstm, PuncClassifier, PuncModel, RnnLm};
pub use tester::{PuncTestArgs, PuncTestResult, PuncTester};
pub use trainer::{PuncLoader, PuncTrainArgs, PuncTrainer};
