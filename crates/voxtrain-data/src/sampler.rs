//! Rank-aware batch sampling.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Splits dataset indices across ranks and groups them into batches.
///
/// The index list is padded by repeating its head so every rank sees the
/// same number of samples, then shuffled with `seed + epoch` so that all
/// ranks agree on the permutation without communicating.
#[derive(Debug, Clone)]
pub struct DistributedBatchSampler {
    dataset_len: usize,
    batch_size: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    epoch: usize,
}

impl DistributedBatchSampler {
    /// Create a sampler for `rank` out of `num_replicas`.
    pub fn new(
        dataset_len: usize,
        batch_size: usize,
        num_replicas: usize,
        rank: usize,
        shuffle: bool,
        drop_last: bool,
    ) -> Self {
        let num_replicas = num_replicas.max(1);
        Self {
            dataset_len,
            batch_size: batch_size.max(1),
            num_replicas,
            rank: rank.min(num_replicas - 1),
            shuffle,
            drop_last,
            seed: 0,
            epoch: 0,
        }
    }

    /// Single-process sampler.
    pub fn single(dataset_len: usize, batch_size: usize, shuffle: bool, drop_last: bool) -> Self {
        Self::new(dataset_len, batch_size, 1, 0, shuffle, drop_last)
    }

    /// Set the base shuffle seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Select the permutation for `epoch`.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    /// Current epoch.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Samples assigned to this rank per epoch.
    pub fn num_samples(&self) -> usize {
        self.dataset_len.div_ceil(self.num_replicas)
    }

    /// Batches per epoch on this rank.
    pub fn len(&self) -> usize {
        let n = self.num_samples();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    /// Whether the sampler yields no batches.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index batches for the current epoch.
    pub fn batches(&self) -> Vec<Vec<usize>> {
        if self.dataset_len == 0 {
            return Vec::new();
        }
        let total = self.num_samples() * self.num_replicas;
        let mut indices: Vec<usize> = (0..self.dataset_len).collect();
        let mut k = 0;
        while indices.len() < total {
            indices.push(indices[k % self.dataset_len]);
            k += 1;
        }

        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            indices.shuffle(&mut rng);
        }

        let local: Vec<usize> = indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect();

        local
            .chunks(self.batch_size)
            .filter(|chunk| !self.drop_last || chunk.len() == self.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }
}
