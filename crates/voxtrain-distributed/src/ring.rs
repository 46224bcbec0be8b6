//! Ring all-reduce over TCP.

use crate::{
    config::DistributedConfig,
    error::DistributedError,
    transport::{TcpTransport, TransportReceiver, TransportSender},
    DistributedBackend,
};
use anyhow::Result;
use async_trait::async_trait;
use bytemuck::{cast_slice, cast_slice_mut};
use tokio::sync::Mutex;

/// Backend that sums f32 buffers around a TCP ring.
pub struct RingBackend {
    rank: usize,
    world_size: usize,
    sender: Mutex<TransportSender>,
    receiver: Mutex<TransportReceiver>,
}

impl RingBackend {
    /// Connect this rank into the ring described by `config`.
    pub async fn new(config: DistributedConfig) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = TcpTransport::connect(&config).await?;
        Ok(Self {
            rank: config.rank,
            world_size: config.nodes.len(),
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
        })
    }

    fn chunk_range(&self, len: usize, idx: usize) -> std::ops::Range<usize> {
        let chunk_size = len / self.world_size;
        let remainder = len % self.world_size;
        let start = idx * chunk_size + idx.min(remainder);
        let end = start + chunk_size + usize::from(idx < remainder);
        start..end
    }
}

#[async_trait]
impl DistributedBackend for RingBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_reduce(&self, buffer: &mut [u8]) -> Result<()> {
        let elem = std::mem::size_of::<f32>();
        if buffer.len() % elem != 0 {
            return Err(DistributedError::BufferSize {
                expected: elem,
                actual: buffer.len(),
            }
            .into());
        }
        if buffer.as_ptr() as usize % std::mem::align_of::<f32>() != 0 {
            return Err(DistributedError::BufferAlignment {
                expected: std::mem::align_of::<f32>(),
            }
            .into());
        }

        let floats: &mut [f32] = cast_slice_mut(buffer);
        let len = floats.len();
        let world = self.world_size;

        let mut sender = self.sender.lock().await;
        let mut receiver = self.receiver.lock().await;

        let mut recv_buf = vec![0f32; len / world + 1];

        // Scatter-reduce: after world-1 rounds each rank owns one fully summed chunk.
        let mut send_idx = self.rank;
        let mut recv_idx = (self.rank + world - 1) % world;
        for _ in 0..world - 1 {
            let send_range = self.chunk_range(len, send_idx);
            let recv_range = self.chunk_range(len, recv_idx);

            let send_buf: Vec<u8> = cast_slice(&floats[send_range]).to_vec();
            let incoming = &mut recv_buf[..recv_range.len()];
            tokio::try_join!(
                sender.send(&send_buf),
                receiver.recv(cast_slice_mut(&mut *incoming))
            )?;

            for (dst, src) in floats[recv_range].iter_mut().zip(incoming.iter()) {
                *dst += *src;
            }

            send_idx = recv_idx;
            recv_idx = (recv_idx + world - 1) % world;
        }

        // All-gather: circulate the summed chunks.
        send_idx = (self.rank + 1) % world;
        recv_idx = self.rank;
        for _ in 0..world - 1 {
            let send_range = self.chunk_range(len, send_idx);
            let recv_range = self.chunk_range(len, recv_idx);

            let send_buf: Vec<u8> = cast_slice(&floats[send_range]).to_vec();
            let incoming = &mut recv_buf[..recv_range.len()];
            tokio::try_join!(
                sender.send(&send_buf),
                receiver.recv(cast_slice_mut(&mut *incoming))
            )?;

            floats[recv_range].copy_from_slice(incoming);

            send_idx = recv_idx;
            recv_idx = (recv_idx + world - 1) % world;
        }

        Ok(())
    }

    async fn barrier(&self) -> Result<()> {
        let mut buf = [0f32; 1];
        self.all_reduce(cast_slice_mut(&mut buf)).await
    }
}
