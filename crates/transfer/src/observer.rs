//! Session callbacks invoked by the channel senders.

use tokio::sync::mpsc;
use tracing::trace;

use crate::types::{ChannelId, Chunk};

/// Receives per-chunk outcomes.
///
/// Senders for different channels call into the same observer from
/// separate tasks, so implementations must be thread-safe and should
/// return quickly.
pub trait TransferObserver: Send + Sync {
    /// Percentage of the source read while chunking.
    fn on_chunking_progress(&self, _percent: u8) {}

    /// Percentage of `chunk`'s payload written so far.
    fn on_chunk_progress(&self, _chunk: &Chunk, _percent: u8) {}

    /// `chunk` was fully written and flushed.
    fn on_chunk_complete(&self, _chunk: &Chunk) {}

    /// Writing `chunk` failed; it is now Failed.
    fn on_chunk_error(&self, _chunk: &Chunk, _message: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

/// Observer callbacks as owned events.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    ChunkingProgress {
        percent: u8,
    },
    ChunkProgress {
        index: u32,
        channel: Option<ChannelId>,
        percent: u8,
    },
    ChunkComplete {
        index: u32,
        channel: Option<ChannelId>,
    },
    ChunkError {
        index: u32,
        channel: Option<ChannelId>,
        message: String,
    },
}

/// Forwards callbacks into a bounded channel without ever blocking the
/// sender; events are dropped when the receiver lags.
#[derive(Debug, Clone)]
pub struct EventObserver {
    tx: mpsc::Sender<TransferEvent>,
}

impl EventObserver {
    pub fn new(tx: mpsc::Sender<TransferEvent>) -> Self {
        Self { tx }
    }

    /// Creates an observer together with the receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TransferEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    fn emit(&self, event: TransferEvent) {
        if let Err(e) = self.tx.try_send(event) {
            trace!(error = %e, "transfer event dropped");
        }
    }
}

impl TransferObserver for EventObserver {
    fn on_chunking_progress(&self, percent: u8) {
        self.emit(TransferEvent::ChunkingProgress { percent });
    }

    fn on_chunk_progress(&self, chunk: &Chunk, percent: u8) {
        self.emit(TransferEvent::ChunkProgress {
            index: chunk.index(),
            channel: chunk.assigned_channel(),
            percent,
        });
    }

    fn on_chunk_complete(&self, chunk: &Chunk) {
        self.emit(TransferEvent::ChunkComplete {
            index: chunk.index(),
            channel: chunk.assigned_channel(),
        });
    }

    fn on_chunk_error(&self, chunk: &Chunk, message: &str) {
        self.emit(TransferEvent::ChunkError {
            index: chunk.index(),
            channel: chunk.assigned_channel(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_forwarded() {
        let (observer, mut rx) = EventObserver::channel(8);
        let chunk = Chunk::new("a_chunk_4", 4, vec![0; 3]);
        chunk.assign(ChannelId::Wired).unwrap();

        observer.on_chunking_progress(40);
        observer.on_chunk_progress(&chunk, 50);
        observer.on_chunk_complete(&chunk);
        observer.on_chunk_error(&chunk, "broken pipe");

        assert_eq!(
            rx.try_recv().unwrap(),
            TransferEvent::ChunkingProgress { percent: 40 }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            TransferEvent::ChunkProgress {
                index: 4,
                channel: Some(ChannelId::Wired),
                percent: 50
            }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransferEvent::ChunkComplete { index: 4, .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransferEvent::ChunkError { ref message, .. } if message == "broken pipe"
        ));
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (observer, mut rx) = EventObserver::channel(1);
        observer.on_chunking_progress(10);
        observer.on_chunking_progress(20);
        assert_eq!(
            rx.try_recv().unwrap(),
            TransferEvent::ChunkingProgress { percent: 10 }
        );
        assert!(rx.try_recv().is_err());
    }
}
