//! Error types for distributed operations.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur during distributed operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connecting to a peer gave up.
    #[error("Max retries ({max_retries}) exceeded connecting to {addr}")]
    MaxRetriesExceeded {
        /// Peer address.
        addr: SocketAddr,
        /// Attempts made.
        max_retries: u32,
    },

    /// A peer sent a frame of unexpected size.
    #[error("Expected {expected} bytes, got {actual}")]
    FrameSize {
        /// Expected byte count.
        expected: usize,
        /// Received byte count.
        actual: usize,
    },

    /// The reduction buffer is not a whole number of f32 values.
    #[error("Buffer size error: expected multiple of {expected}, got {actual}")]
    BufferSize {
        /// Required element size.
        expected: usize,
        /// Buffer length.
        actual: usize,
    },

    /// The reduction buffer is misaligned for f32.
    #[error("Buffer alignment error: expected {expected}-byte alignment")]
    BufferAlignment {
        /// Required alignment.
        expected: usize,
    },

    /// The incoming ring link came from a rank other than our predecessor.
    #[error("Ring link from rank {actual}, expected rank {expected}")]
    PeerMismatch {
        /// Predecessor rank.
        expected: usize,
        /// Rank announced by the peer.
        actual: usize,
    },

    /// A connection attempt timed out.
    #[error("Timeout waiting for incoming connection ({0}ms)")]
    AcceptTimeout(u64),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result alias for distributed operations.
pub type DistributedResult<T> = std::result::Result<T, DistributedError>;
