//! Per-channel send loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use multilink_transfer::{ChannelId, ChannelQueueSet, Chunk, SpeedCalculator, TransferObserver};

use crate::client::ChannelConnection;
use crate::error::DataChannelError;
use crate::wire::{ChunkHeader, write_chunk_frame};
use crate::{DEFAULT_WRITE_BLOCK_SIZE, IDLE_BACKOFF};

/// Tunables for a [`ChannelSender`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderConfig {
    /// Payload bytes written between progress reports.
    pub block_size: usize,
    /// Sleep between polls of an empty queue.
    pub idle_backoff: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_WRITE_BLOCK_SIZE,
            idle_backoff: IDLE_BACKOFF,
        }
    }
}

/// Observed state of one channel, shared between its sender and whoever
/// feeds liveness to the balancer.
pub struct ChannelHealth {
    meter: SpeedCalculator,
    connected: AtomicBool,
}

impl ChannelHealth {
    pub fn new() -> Self {
        Self {
            meter: SpeedCalculator::default(),
            connected: AtomicBool::new(true),
        }
    }

    pub fn meter(&self) -> &SpeedCalculator {
        &self.meter
    }

    /// Bytes per second written recently.
    pub fn throughput(&self) -> f64 {
        self.meter.bytes_per_second()
    }

    /// `false` once a write on the channel failed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn mark_down(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

impl Default for ChannelHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters returned when a sender exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub channel: ChannelId,
    pub sent: usize,
    pub failed: usize,
    pub bytes: u64,
}

/// Drains one channel's queue onto its connection.
///
/// Chunks are pulled in FIFO order, marked Transferring, written in
/// blocks and marked Completed or Failed. A failed chunk is reported and
/// the loop moves on to the next one; nothing is retried. Cancellation is
/// checked between chunks, never in the middle of a chunk frame.
pub struct ChannelSender {
    channel: ChannelId,
    queues: Arc<ChannelQueueSet>,
    observer: Arc<dyn TransferObserver>,
    health: Arc<ChannelHealth>,
    config: SenderConfig,
    cancel: CancellationToken,
}

impl ChannelSender {
    pub fn new(
        channel: ChannelId,
        queues: Arc<ChannelQueueSet>,
        observer: Arc<dyn TransferObserver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            queues,
            observer,
            health: Arc::new(ChannelHealth::new()),
            config: SenderConfig::default(),
            cancel,
        }
    }

    pub fn with_config(mut self, config: SenderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_health(mut self, health: Arc<ChannelHealth>) -> Self {
        self.health = health;
        self
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn health(&self) -> Arc<ChannelHealth> {
        Arc::clone(&self.health)
    }

    /// Runs until cancelled and hands the connection back.
    pub async fn run(self, mut conn: ChannelConnection) -> (ChannelConnection, SenderReport) {
        let channel = self.channel;
        let mut report = SenderReport {
            channel,
            sent: 0,
            failed: 0,
            bytes: 0,
        };
        info!(%channel, "sender started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(chunk) = self.queues.get_next_chunk(channel) else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_backoff) => continue,
                }
            };
            self.send_chunk(&mut conn, &chunk, &mut report).await;
        }

        info!(
            %channel,
            sent = report.sent,
            failed = report.failed,
            bytes = report.bytes,
            "sender stopped"
        );
        (conn, report)
    }

    async fn send_chunk(&self, conn: &mut ChannelConnection, chunk: &Chunk, report: &mut SenderReport) {
        let channel = self.channel;
        if let Err(e) = chunk.begin_transfer() {
            warn!(%channel, chunk = chunk.id(), error = %e, "chunk skipped");
            return;
        }

        match self.write_chunk(conn, chunk).await {
            Ok(()) => {
                if let Err(e) = chunk.complete() {
                    warn!(%channel, chunk = chunk.id(), error = %e, "chunk state not updated");
                }
                report.sent += 1;
                report.bytes += chunk.size() as u64;
                debug!(%channel, index = chunk.index(), size = chunk.size(), "chunk sent");
                self.observer.on_chunk_complete(chunk);
            }
            Err(e) => {
                if let Err(e) = chunk.fail() {
                    warn!(%channel, chunk = chunk.id(), error = %e, "chunk state not updated");
                }
                report.failed += 1;
                // Only a failed write says anything about the link.
                if matches!(e, DataChannelError::Io(_)) {
                    self.health.mark_down();
                }
                warn!(%channel, index = chunk.index(), error = %e, "chunk send failed");
                self.observer.on_chunk_error(chunk, &e.to_string());
            }
        }
    }

    async fn write_chunk(&self, conn: &mut ChannelConnection, chunk: &Chunk) -> Result<(), DataChannelError> {
        let header = ChunkHeader::for_chunk(chunk)?;
        let total = chunk.size();
        let mut reported = 0usize;

        write_chunk_frame(
            conn.writer_mut(),
            &header,
            chunk.payload(),
            self.config.block_size,
            |written| {
                let percent = (written * 100 / total) as u8;
                chunk.set_progress(percent);
                self.health.meter().add_sample((written - reported) as u64);
                reported = written;
                self.observer.on_chunk_progress(chunk, percent);
            },
        )
        .await
    }
}
