//! DataLoader for creating training batches.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use voxtrain_core::{Dataset, Result};

use crate::collator::Collator;
use crate::sampler::DistributedBatchSampler;

/// Configuration for the DataLoader.
#[derive(Debug, Clone)]
pub struct DataLoaderConfig {
    /// Batch size per rank.
    pub batch_size: usize,
    /// Whether to shuffle every epoch.
    pub shuffle: bool,
    /// Whether to drop the last incomplete batch.
    pub drop_last: bool,
    /// Seed for shuffling and collator randomness.
    pub seed: u64,
    /// Number of ranks sharing the dataset.
    pub num_replicas: usize,
    /// This process's rank.
    pub rank: usize,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            shuffle: true,
            drop_last: false,
            seed: 42,
            num_replicas: 1,
            rank: 0,
        }
    }
}

/// DataLoader that yields collated batches from a dataset.
///
/// One pass of [`DataLoader::next_batch`] covers one epoch; call
/// [`DataLoader::set_epoch`] to start the next one.
pub struct DataLoader<D, C> {
    dataset: Arc<D>,
    collator: C,
    sampler: DistributedBatchSampler,
    seed: u64,
    rank: usize,
    batches: Vec<Vec<usize>>,
    position: usize,
    rng: StdRng,
}

impl<D, C> DataLoader<D, C>
where
    D: Dataset,
    C: Collator<D::Item>,
{
    /// Create a new DataLoader positioned at epoch 0.
    pub fn new(dataset: Arc<D>, collator: C, config: DataLoaderConfig) -> Self {
        let sampler = DistributedBatchSampler::new(
            dataset.len(),
            config.batch_size,
            config.num_replicas,
            config.rank,
            config.shuffle,
            config.drop_last,
        )
        .with_seed(config.seed);
        let batches = sampler.batches();
        Self {
            dataset,
            collator,
            sampler,
            seed: config.seed,
            rank: config.rank,
            batches,
            position: 0,
            rng: Self::make_rng(config.seed, 0, config.rank),
        }
    }

    fn make_rng(seed: u64, epoch: usize, rank: usize) -> StdRng {
        StdRng::seed_from_u64(
            seed.wrapping_mul(1_000_003)
                .wrapping_add((epoch as u64) << 16)
                .wrapping_add(rank as u64),
        )
    }

    /// Start `epoch`: reshuffle and rewind.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.sampler.set_epoch(epoch);
        self.batches = self.sampler.batches();
        self.position = 0;
        self.rng = Self::make_rng(self.seed, epoch, self.rank);
    }

    /// Current epoch.
    pub fn epoch(&self) -> usize {
        self.sampler.epoch()
    }

    /// Batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    /// Underlying dataset.
    pub fn dataset(&self) -> &Arc<D> {
        &self.dataset
    }

    /// Get the next batch of the current epoch.
    ///
    /// Batches the collator filters out entirely are skipped.
    pub fn next_batch(&mut self) -> Option<Result<C::Batch>> {
        while self.position < self.batches.len() {
            let indices = &self.batches[self.position];
            self.position += 1;

            let samples: Vec<D::Item> = indices.iter().filter_map(|&i| self.dataset.get(i)).collect();
            match self.collator.collate(samples, &mut self.rng) {
                Ok(Some(batch)) => return Some(Ok(batch)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

impl<D, C> Iterator for DataLoader<D, C>
where
    D: Dataset,
    C: Collator<D::Item>,
{
    type Item = Result<C::Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}
