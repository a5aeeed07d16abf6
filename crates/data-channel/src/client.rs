//! Sender-side channel connection.
//!
//! One [`ChannelConnection`] per channel: a buffered byte sink to the
//! receiver, opened over TCP or wrapped around any async writer.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use multilink_transfer::ChannelId;

use crate::TCP_BUFFER_SIZE;
use crate::error::DataChannelError;
use crate::wire::{TransferMetadata, write_metadata};

/// Boxed byte sink behind a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Buffered writer bound to one channel.
pub struct ChannelConnection {
    channel: ChannelId,
    peer: Option<SocketAddr>,
    writer: BufWriter<BoxedWriter>,
}

impl fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("channel", &self.channel)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl ChannelConnection {
    /// Connects to `addr` for `channel`, giving up after `timeout`.
    pub async fn connect(
        channel: ChannelId,
        addr: SocketAddr,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self, DataChannelError> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DataChannelError::Cancelled);
            }
            result = tokio::time::timeout(timeout, TcpStream::connect(addr)) => {
                match result {
                    Ok(Ok(s)) => {
                        info!(%channel, %addr, "channel connected");
                        s
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(DataChannelError::Timeout),
                }
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%channel, error = %e, "TCP_NODELAY not applied");
        }

        let mut conn = Self::from_writer(channel, stream);
        conn.peer = Some(addr);
        Ok(conn)
    }

    /// Wraps an arbitrary writer, e.g. an in-memory duplex in tests.
    pub fn from_writer(channel: ChannelId, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            channel,
            peer: None,
            writer: BufWriter::with_capacity(TCP_BUFFER_SIZE, Box::new(writer)),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Writes and flushes the transfer announcement.
    pub async fn send_metadata(&mut self, metadata: &TransferMetadata) -> Result<(), DataChannelError> {
        write_metadata(&mut self.writer, metadata).await?;
        self.writer.flush().await?;
        debug!(
            channel = %self.channel,
            transfer_id = %metadata.transfer_id,
            total_chunks = metadata.total_chunks,
            "metadata sent"
        );
        Ok(())
    }

    pub(crate) fn writer_mut(&mut self) -> &mut BufWriter<BoxedWriter> {
        &mut self.writer
    }

    /// Flushes pending bytes and shuts the sink down.
    pub async fn shutdown(mut self) -> Result<(), DataChannelError> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        debug!(channel = %self.channel, "channel closed");
        Ok(())
    }
}
