//! TCP links between neighbouring ranks of the gradient ring.
//!
//! Frames are a little-endian `u32` length followed by the payload. The
//! first frame on every link is a handshake carrying the sender's rank, so a
//! rank that accepts a connection from anyone but its predecessor fails fast
//! instead of exchanging gradients with the wrong peer.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::config::DistributedConfig;
use crate::error::DistributedError;

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5000;

/// Writes frames to the next rank.
pub struct TransportSender {
    stream: OwnedWriteHalf,
}

/// Reads frames from the previous rank.
pub struct TransportReceiver {
    stream: OwnedReadHalf,
}

impl TransportSender {
    /// Send one frame.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| DistributedError::FrameSize {
            expected: u32::MAX as usize,
            actual: data.len(),
        })?;
        self.stream.write_all(&len.to_le_bytes()).await?;
        self.stream.write_all(data).await?;
        Ok(())
    }
}

impl TransportReceiver {
    /// Receive one frame into `buffer`, which must match its size.
    pub async fn recv(&mut self, buffer: &mut [u8]) -> Result<()> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await?;
        let len = u32::from_le_bytes(header) as usize;
        if len != buffer.len() {
            return Err(DistributedError::FrameSize {
                expected: buffer.len(),
                actual: len,
            }
            .into());
        }
        self.stream.read_exact(buffer).await?;
        Ok(())
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis((INITIAL_BACKOFF_MS << attempt.min(6)).min(MAX_BACKOFF_MS))
}

/// Dial `addr` until it answers or `max_retries` attempts fail.
async fn dial(addr: SocketAddr, max_retries: u32) -> Result<TcpStream> {
    for attempt in 0..max_retries {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::warn!(error = %e, "Failed to set TCP_NODELAY");
                }
                return Ok(stream);
            }
            Err(e) => {
                if attempt == 0 {
                    tracing::debug!(addr = %addr, error = %e, "Peer not up yet, retrying");
                }
                tokio::time::sleep(backoff(attempt + 1)).await;
            }
        }
    }
    Err(DistributedError::MaxRetriesExceeded { addr, max_retries }.into())
}

/// Accept one connection on `listener` within `timeout_ms`.
async fn accept(listener: &TcpListener, timeout_ms: u64) -> Result<TcpStream> {
    let (stream, peer) = timeout(Duration::from_millis(timeout_ms), listener.accept())
        .await
        .map_err(|_| DistributedError::AcceptTimeout(timeout_ms))?
        .map_err(DistributedError::Io)?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(error = %e, "Failed to set TCP_NODELAY on incoming link");
    }
    tracing::debug!(peer = %peer, "Accepted incoming link");
    Ok(stream)
}

async fn announce(sender: &mut TransportSender, rank: usize) -> Result<()> {
    sender.send(&(rank as u32).to_le_bytes()).await
}

async fn expect_rank(receiver: &mut TransportReceiver, expected: usize) -> Result<()> {
    let mut buf = [0u8; 4];
    receiver.recv(&mut buf).await?;
    let actual = u32::from_le_bytes(buf) as usize;
    if actual != expected {
        return Err(DistributedError::PeerMismatch { expected, actual }.into());
    }
    Ok(())
}

/// Ring wiring over TCP.
pub struct TcpTransport;

impl TcpTransport {
    /// Link this rank to its neighbours.
    ///
    /// Rank `r` dials rank `r + 1` and accepts a link from rank `r - 1`
    /// (both modulo the world size). Returns the sending half towards the
    /// next rank and the receiving half from the previous one.
    pub async fn connect(config: &DistributedConfig) -> Result<(TransportSender, TransportReceiver)> {
        let rank = config.rank;
        let next_rank = config.next_rank();
        let prev_rank = config.prev_rank();

        let listener = TcpListener::bind(config.nodes[rank]).await?;
        tracing::info!(rank, addr = %config.nodes[rank], "Listening for ring peer");

        let (next, prev) = tokio::try_join!(
            dial(config.nodes[next_rank], config.max_retries),
            accept(&listener, config.connection_timeout_ms)
        )?;

        let (_, write_next) = next.into_split();
        let (read_prev, _) = prev.into_split();
        let mut sender = TransportSender { stream: write_next };
        let mut receiver = TransportReceiver { stream: read_prev };

        tokio::try_join!(
            announce(&mut sender, rank),
            expect_rank(&mut receiver, prev_rank)
        )?;
        tracing::info!(rank, next_rank, prev_rank, "Ring link established");

        Ok((sender, receiver))
    }
}
