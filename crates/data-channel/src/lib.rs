//! TCP data channels for multilink transfers.
//!
//! Each physical link (wired, wireless) gets its own TCP connection. The
//! sender side announces the transfer with a metadata frame and then
//! streams chunk frames pulled from its channel queue; the receiver side
//! verifies every chunk and reassembles the file once all indices arrived.
//!
//! # Wire format
//!
//! See the [`wire`] module for the frame layout.

pub mod client;
pub mod error;
pub mod reassembly;
pub mod sender;
pub mod server;
pub mod wire;

pub use client::ChannelConnection;
pub use error::DataChannelError;
pub use reassembly::{Reassembler, ReceivedFile, StoreOutcome};
pub use sender::{ChannelHealth, ChannelSender, SenderConfig, SenderReport};
pub use server::TcpChunkReceiver;
pub use wire::{ChunkHeader, TransferMetadata};

use std::time::Duration;

/// TCP read/write buffer size (256 KB).
pub const TCP_BUFFER_SIZE: usize = 256 * 1024;

/// Payload bytes written between two progress reports.
pub const DEFAULT_WRITE_BLOCK_SIZE: usize = 8 * 1024;

/// Timeout for the TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before a sender polls its empty queue again.
pub const IDLE_BACKOFF: Duration = Duration::from_millis(50);

/// Largest string accepted in a frame (10 MiB).
pub const MAX_STRING_LEN: usize = 10 * 1024 * 1024;

/// Largest chunk payload accepted in a frame (50 MiB).
pub const MAX_CHUNK_SIZE: usize = 50 * 1024 * 1024;
