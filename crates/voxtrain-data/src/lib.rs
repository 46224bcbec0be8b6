//! Dataset handling and batching for voxtrain.
//!
//! This crate provides:
//! - The punctuation corpus ([`PuncDataset`]) and vocoder corpus ([`WaveMelDataset`])
//! - Collators that stack rows or cut aligned wave/mel windows
//! - A rank-aware batch sampler and a DataLoader driven by epochs

#![warn(missing_docs)]

pub mod collator;
pub mod dataloader;
pub mod dataset;
pub mod sampler;

pub use collator::*;
pub use dataloader::*;
pub use dataset::*;
pub use sampler::*;
