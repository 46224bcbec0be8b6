//! Rank coordination for data-parallel voxtrain runs.
//!
//! Every process in a run gets a rank. Rank 0 is the master: it alone writes
//! checkpoints, dumps configs and runs evaluators. Gradients are averaged
//! across ranks with a ring all-reduce over TCP.
//!
//! # Manual Configuration
//!
//! ```ignore
//! use voxtrain_distributed::{DistributedConfig, RingBackend, DistributedContext};
//!
//! let config = DistributedConfig::new(
//!     vec!["192.168.1.10:52416".parse()?, "192.168.1.11:52416".parse()?],
//!     0, // This node's rank
//! );
//!
//! let backend = RingBackend::new(config).await?;
//! let ctx = DistributedContext::new(Box::new(backend));
//! ctx.all_reduce_mean_f32(&mut grads).await?;
//! ```
//!
//! The same layout can come from the environment (`VOXTRAIN_NODES`,
//! `VOXTRAIN_RANK`) through [`DistributedContext::from_env`].

use anyhow::Result;
use async_trait::async_trait;

pub mod config;
pub mod error;
pub mod ring;
pub mod transport;

pub use config::DistributedConfig;
pub use error::{DistributedError, DistributedResult};
pub use ring::RingBackend;

/// Interface for distributed operations.
#[async_trait]
pub trait DistributedBackend: Send + Sync {
    /// Get the rank of this node (0 to world_size - 1).
    fn rank(&self) -> usize;

    /// Get the total number of nodes.
    fn world_size(&self) -> usize;

    /// Sum an f32 buffer (as bytes) element-wise across all nodes.
    async fn all_reduce(&self, buffer: &mut [u8]) -> Result<()>;

    /// Barrier synchronization.
    async fn barrier(&self) -> Result<()>;
}

/// Single-process backend: rank 0 of 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalBackend;

#[async_trait]
impl DistributedBackend for LocalBackend {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn all_reduce(&self, _buffer: &mut [u8]) -> Result<()> {
        Ok(())
    }

    async fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// A handle to the distributed runtime.
pub struct DistributedContext {
    backend: Box<dyn DistributedBackend>,
}

impl DistributedContext {
    /// Create a new distributed context with the given backend.
    pub fn new(backend: Box<dyn DistributedBackend>) -> Self {
        Self { backend }
    }

    /// Single-process context.
    pub fn local() -> Self {
        Self::new(Box::new(LocalBackend))
    }

    /// Build a ring context from `VOXTRAIN_NODES`/`VOXTRAIN_RANK`, or a local
    /// one when those are unset or name a single node.
    pub async fn from_env() -> Result<Self> {
        match DistributedConfig::from_env()? {
            Some(config) if config.world_size() > 1 => {
                tracing::info!(
                    rank = config.rank,
                    world_size = config.world_size(),
                    "Joining training ring"
                );
                Ok(Self::new(Box::new(RingBackend::new(config).await?)))
            }
            _ => Ok(Self::local()),
        }
    }

    /// Get the rank of this node.
    pub fn rank(&self) -> usize {
        self.backend.rank()
    }

    /// Get the total number of nodes in the cluster.
    pub fn world_size(&self) -> usize {
        self.backend.world_size()
    }

    /// Check if this is the master node (rank 0).
    pub fn is_master(&self) -> bool {
        self.rank() == 0
    }

    /// Whether more than one process takes part.
    pub fn is_parallel(&self) -> bool {
        self.world_size() > 1
    }

    /// Perform an all-reduce operation (sum) on the buffer.
    pub async fn all_reduce(&self, buffer: &mut [u8]) -> Result<()> {
        let start = std::time::Instant::now();
        let result = self.backend.all_reduce(buffer).await;
        tracing::trace!(
            bytes = buffer.len(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            ok = result.is_ok(),
            "all_reduce"
        );
        result
    }

    /// Average `values` element-wise across all nodes.
    pub async fn all_reduce_mean_f32(&self, values: &mut [f32]) -> Result<()> {
        if !self.is_parallel() {
            return Ok(());
        }
        self.all_reduce(bytemuck::cast_slice_mut(values)).await?;
        let world = self.world_size() as f32;
        for v in values.iter_mut() {
            *v /= world;
        }
        Ok(())
    }

    /// Synchronize all nodes at a barrier.
    pub async fn barrier(&self) -> Result<()> {
        self.backend.barrier().await
    }
}

impl Default for DistributedContext {
    fn default() -> Self {
        Self::local()
    }
}

impl std::fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedContext")
            .field("rank", &self.rank())
            .field("world_size", &self.world_size())
            .finish()
    }
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::DistributedConfig;
    pub use crate::error::{DistributedError, DistributedResult};
    pub use crate::ring::RingBackend;
    pub use crate::DistributedBackend;
    pub use crate::DistributedContext;
    pub use crate::LocalBackend;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_context() {
        let ctx = DistributedContext::local();
        assert_eq!(ctx.rank(), 0);
        assert_eq!(ctx.world_size(), 1);
        assert!(ctx.is_master());
        assert!(!ctx.is_parallel());

        let mut values = vec![1.0f32, 2.0, 3.0];
        ctx.all_reduce_mean_f32(&mut values).await.unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        ctx.barrier().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ring_mean() {
        let nodes: Vec<std::net::SocketAddr> = (0..2)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect::<Vec<_>>()
            .iter()
            .map(|l| l.local_addr().unwrap())
            .collect();

        let mut handles = Vec::new();
        for rank in 0..2 {
            let config = DistributedConfig::new(nodes.clone(), rank);
            handles.push(tokio::spawn(async move {
                let ctx = DistributedContext::new(Box::new(RingBackend::new(config).await.unwrap()));
                assert!(ctx.is_parallel());
                let mut values = vec![rank as f32 * 2.0; 5];
                ctx.all_reduce_mean_f32(&mut values).await.unwrap();
                values
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), vec![1.0; 5]);
        }
    }
}
