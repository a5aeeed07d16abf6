//! Coordinator error types.

use multilink_data_channel::DataChannelError;
use multilink_transfer::{ChannelId, TransferError};

/// Errors produced while running a transfer session.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("data channel error: {0}")]
    DataChannel(#[from] DataChannelError),

    #[error("failed to open {channel} channel: {source}")]
    ChannelOpen {
        channel: ChannelId,
        source: DataChannelError,
    },

    #[error("{0} channel is not open")]
    ChannelNotOpen(ChannelId),

    #[error("no channel available")]
    NoChannelAvailable,

    #[error("no session prepared")]
    SessionNotPrepared,

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),
}
