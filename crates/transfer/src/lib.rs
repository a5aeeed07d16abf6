//! Chunked multi-channel transfer core.
//!
//! Splits a byte stream into checksummed chunks, spreads them across the
//! available transport channels and keeps the per-channel queues balanced
//! while the senders drain them.

mod balancer;
mod chunked;
mod observer;
mod progress;
mod session;
mod types;
mod validation;

use std::sync::{LockResult, PoisonError};

pub use balancer::{BalancerConfig, ChannelQueueSet, ChannelShare, RebalanceOutcome};
pub use chunked::{ByteSource, ChunkReader, FileSource, MemorySource, checksum_bytes, chunk_source};
pub use observer::{EventObserver, NoopObserver, TransferEvent, TransferObserver};
pub use progress::{ProgressCallback, ProgressTracker, SpeedCalculator};
pub use session::{SessionProgress, SessionStatus, TransferSession};
pub use types::{Assignment, ChannelId, ChannelLiveness, Chunk, ChunkStatus, LivenessMap};
pub use validation::validate_file_name;

/// Default chunk size: 512 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Smallest chunk size accepted; smaller requests are clamped up to this.
///
/// Bounds the per-chunk framing overhead on the wire.
pub const MIN_CHUNK_SIZE: usize = 64 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no channel available")]
    NoChannelAvailable,

    #[error("chunk has no assigned channel: {0}")]
    UnassignedChunk(String),

    #[error("channel not configured: {0}")]
    UnknownChannel(ChannelId),

    #[error("invalid status transition for {chunk}: {from:?} -> {to:?}")]
    InvalidTransition {
        chunk: String,
        from: ChunkStatus,
        to: ChunkStatus,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// Takes the guard out of a lock result even if a writer panicked.
pub(crate) fn recover<G>(result: LockResult<G>) -> G {
    result.unwrap_or_else(PoisonError::into_inner)
}
