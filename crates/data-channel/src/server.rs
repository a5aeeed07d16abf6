//! TCP chunk receiver.
//!
//! Accepts one connection per sending channel, decodes the metadata frame
//! and then chunk frames until EOF, and hands every chunk to a shared
//! [`Reassembler`]. Returns once the file is rebuilt.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, BufReader};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TCP_BUFFER_SIZE;
use crate::error::DataChannelError;
use crate::reassembly::{Reassembler, ReceivedFile, StoreOutcome};
use crate::wire::{read_chunk_header, read_chunk_payload, read_metadata};

/// Receives a multi-channel transfer into a directory.
pub struct TcpChunkReceiver {
    base_path: PathBuf,
    cancel: CancellationToken,
}

impl TcpChunkReceiver {
    pub fn new(base_path: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            base_path: base_path.into(),
            cancel,
        }
    }

    /// Binds the listener the senders connect to.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<(SocketAddr, TcpListener), DataChannelError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, out = %self.base_path.display(), "receiver listening");
        Ok((local, listener))
    }

    /// Accepts connections until every chunk of the announced transfer is
    /// stored, then assembles the file.
    ///
    /// Connections still open at that point are dropped.
    pub async fn accept_and_receive(&self, listener: TcpListener) -> Result<ReceivedFile, DataChannelError> {
        tokio::fs::create_dir_all(&self.base_path).await?;
        let reassembler = Arc::new(Reassembler::new(&self.base_path));
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    connections.abort_all();
                    return Err(DataChannelError::Cancelled);
                }
                _ = reassembler.wait_complete() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    info!(%addr, "connection accepted");
                    let r = Arc::clone(&reassembler);
                    connections.spawn(async move {
                        let mut reader = BufReader::with_capacity(TCP_BUFFER_SIZE, stream);
                        (addr, receive_stream(&mut reader, &r).await)
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    match joined {
                        Ok((addr, Ok(stored))) => info!(%addr, stored, "connection closed"),
                        Ok((addr, Err(e))) => warn!(%addr, error = %e, "connection failed"),
                        Err(e) => warn!(error = %e, "connection task aborted"),
                    }
                }
            }
        }

        connections.abort_all();
        reassembler.assemble().await
    }
}

/// Reads one connection's metadata and chunk frames into `reassembler`.
///
/// Returns the number of chunks newly stored.
pub async fn receive_stream<R: AsyncRead + Unpin>(
    reader: &mut R,
    reassembler: &Reassembler,
) -> Result<usize, DataChannelError> {
    let metadata = read_metadata(reader).await?;
    reassembler.begin(&metadata).await?;

    let mut stored = 0;
    while let Some(header) = read_chunk_header(reader).await? {
        let payload = read_chunk_payload(reader, header.size).await?;
        if reassembler.store(&header, &payload).await? == StoreOutcome::Stored {
            stored += 1;
        }
    }
    debug!(transfer_id = %metadata.transfer_id, stored, "stream ended");
    Ok(stored)
}
