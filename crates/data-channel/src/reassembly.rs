//! Receiver-side chunk storage and file reassembly.
//!
//! Chunks arriving on any connection are verified and stored as part
//! files under `<base>/<file>_chunks/`. Once every index is present the
//! parts are concatenated by index into `<base>/<file>` through a
//! temporary `.assembling` file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use multilink_transfer::{checksum_bytes, validate_file_name};

use crate::error::DataChannelError;
use crate::wire::{ChunkHeader, TransferMetadata};

/// A file rebuilt from its chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub transfer_id: String,
    pub file_name: String,
    pub path: PathBuf,
    pub file_size: u64,
    pub total_chunks: u32,
    /// Chunks dropped because their payload did not match the checksum.
    pub checksum_mismatches: usize,
}

/// Outcome of storing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// The index was already stored; the payload was discarded.
    Duplicate,
    /// The payload did not match its checksum and was discarded.
    ChecksumMismatch,
}

struct ReassemblyState {
    metadata: Option<TransferMetadata>,
    received: BTreeSet<u32>,
    mismatches: usize,
}

/// Collects the chunks of one transfer from any number of connections.
pub struct Reassembler {
    base_path: PathBuf,
    state: Mutex<ReassemblyState>,
    complete_tx: watch::Sender<bool>,
}

impl Reassembler {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let (complete_tx, _) = watch::channel(false);
        Self {
            base_path: base_path.into(),
            state: Mutex::new(ReassemblyState {
                metadata: None,
                received: BTreeSet::new(),
                mismatches: 0,
            }),
            complete_tx,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Registers the transfer announced on a connection.
    ///
    /// Every connection of a transfer repeats the same metadata; a
    /// connection announcing a different transfer is rejected.
    pub async fn begin(&self, metadata: &TransferMetadata) -> Result<(), DataChannelError> {
        validate_file_name(&metadata.file_name)
            .map_err(|e| DataChannelError::InvalidPath(e.to_string()))?;

        let mut state = self.state.lock().await;
        match &state.metadata {
            Some(current) if current != metadata => {
                return Err(DataChannelError::Protocol(format!(
                    "connection announced transfer {} while receiving {}",
                    metadata.transfer_id, current.transfer_id
                )));
            }
            Some(_) => {}
            None => {
                tokio::fs::create_dir_all(self.parts_dir(&metadata.file_name)).await?;
                info!(
                    transfer_id = %metadata.transfer_id,
                    file = %metadata.file_name,
                    size = metadata.file_size,
                    total_chunks = metadata.total_chunks,
                    "transfer announced"
                );
                state.metadata = Some(metadata.clone());
            }
        }
        self.publish_completion(&state);
        Ok(())
    }

    /// Verifies and stores one chunk payload.
    pub async fn store(&self, header: &ChunkHeader, payload: &[u8]) -> Result<StoreOutcome, DataChannelError> {
        let mut state = self.state.lock().await;
        let Some(metadata) = state.metadata.clone() else {
            return Err(DataChannelError::Protocol("chunk received before metadata".into()));
        };
        if header.index >= metadata.total_chunks {
            return Err(DataChannelError::Protocol(format!(
                "chunk index {} out of range ({} chunks)",
                header.index, metadata.total_chunks
            )));
        }

        if !header.checksum.is_empty() && checksum_bytes(payload) != header.checksum {
            state.mismatches += 1;
            warn!(
                transfer_id = %metadata.transfer_id,
                index = header.index,
                "checksum mismatch, chunk discarded"
            );
            return Ok(StoreOutcome::ChecksumMismatch);
        }
        if state.received.contains(&header.index) {
            debug!(index = header.index, "duplicate chunk ignored");
            return Ok(StoreOutcome::Duplicate);
        }

        let part = self.part_path(&metadata.file_name, header.index);
        let mut file = tokio::fs::File::create(&part).await?;
        file.write_all(payload).await?;
        file.flush().await?;

        state.received.insert(header.index);
        debug!(
            index = header.index,
            bytes = payload.len(),
            received = state.received.len(),
            total = metadata.total_chunks,
            "chunk stored"
        );
        self.publish_completion(&state);
        Ok(StoreOutcome::Stored)
    }

    /// Number of distinct chunk indices stored so far.
    pub async fn received_count(&self) -> usize {
        self.state.lock().await.received.len()
    }

    pub async fn is_complete(&self) -> bool {
        let state = self.state.lock().await;
        Self::complete(&state)
    }

    /// Resolves once every chunk index has been stored.
    pub async fn wait_complete(&self) {
        let mut rx = self.complete_tx.subscribe();
        // The sender lives in self, so the channel cannot close here.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Concatenates the stored parts into the final file.
    pub async fn assemble(&self) -> Result<ReceivedFile, DataChannelError> {
        let state = self.state.lock().await;
        let Some(metadata) = state.metadata.clone() else {
            return Err(DataChannelError::Protocol("no transfer announced".into()));
        };
        if !Self::complete(&state) {
            return Err(DataChannelError::Protocol(format!(
                "missing {} of {} chunks",
                metadata.total_chunks as usize - state.received.len(),
                metadata.total_chunks
            )));
        }

        let output = self.base_path.join(&metadata.file_name);
        let temp = self
            .base_path
            .join(format!("{}.assembling", metadata.file_name));
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match self.concatenate(&metadata, &temp).await {
            Ok(written) if written == metadata.file_size => {}
            Ok(written) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(DataChannelError::Protocol(format!(
                    "assembled {written} bytes, expected {}",
                    metadata.file_size
                )));
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        }
        tokio::fs::rename(&temp, &output).await?;

        for index in 0..metadata.total_chunks {
            let part = self.part_path(&metadata.file_name, index);
            if let Err(e) = tokio::fs::remove_file(&part).await {
                debug!(path = %part.display(), error = %e, "part file not removed");
            }
        }
        if let Err(e) = tokio::fs::remove_dir(self.parts_dir(&metadata.file_name)).await {
            debug!(error = %e, "chunk directory not removed");
        }

        info!(
            transfer_id = %metadata.transfer_id,
            path = %output.display(),
            bytes = metadata.file_size,
            chunks = metadata.total_chunks,
            mismatches = state.mismatches,
            "file assembled"
        );

        Ok(ReceivedFile {
            transfer_id: metadata.transfer_id.clone(),
            file_name: metadata.file_name.clone(),
            path: output,
            file_size: metadata.file_size,
            total_chunks: metadata.total_chunks,
            checksum_mismatches: state.mismatches,
        })
    }

    async fn concatenate(&self, metadata: &TransferMetadata, temp: &Path) -> Result<u64, DataChannelError> {
        let mut out = tokio::fs::File::create(temp).await?;
        let mut written = 0u64;
        for index in 0..metadata.total_chunks {
            let data = tokio::fs::read(self.part_path(&metadata.file_name, index)).await?;
            out.write_all(&data).await?;
            written += data.len() as u64;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(written)
    }

    fn complete(state: &ReassemblyState) -> bool {
        state
            .metadata
            .as_ref()
            .is_some_and(|m| state.received.len() == m.total_chunks as usize)
    }

    fn publish_completion(&self, state: &ReassemblyState) {
        if Self::complete(state) {
            self.complete_tx.send_replace(true);
        }
    }

    fn parts_dir(&self, file_name: &str) -> PathBuf {
        self.base_path.join(format!("{file_name}_chunks"))
    }

    fn part_path(&self, file_name: &str, index: u32) -> PathBuf {
        self.parts_dir(file_name).join(format!("chunk_{index:06}.part"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(total_chunks: u32, file_size: u64) -> TransferMetadata {
        TransferMetadata {
            transfer_id: "t1".into(),
            file_name: "data.bin".into(),
            file_size,
            total_chunks,
        }
    }

    fn header(index: u32, payload: &[u8]) -> ChunkHeader {
        ChunkHeader {
            chunk_id: format!("data.bin_chunk_{index}"),
            checksum: checksum_bytes(payload),
            index,
            size: payload.len() as u32,
        }
    }

    #[tokio::test]
    async fn out_of_order_chunks_assemble_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let r = Reassembler::new(dir.path());
        r.begin(&metadata(3, 9)).await.unwrap();

        for (i, p) in [(2, b"ghi"), (0, b"abc"), (1, b"def")] {
            assert_eq!(r.store(&header(i, p), p).await.unwrap(), StoreOutcome::Stored);
        }
        assert!(r.is_complete().await);
        r.wait_complete().await;

        let file = r.assemble().await.unwrap();
        assert_eq!(std::fs::read(&file.path).unwrap(), b"abcdefghi");
        assert_eq!(file.checksum_mismatches, 0);
        assert!(!dir.path().join("data.bin_chunks").exists());
        assert!(!dir.path().join("data.bin.assembling").exists());
    }

    #[tokio::test]
    async fn checksum_mismatch_is_counted_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let r = Reassembler::new(dir.path());
        r.begin(&metadata(1, 3)).await.unwrap();

        let mut bad = header(0, b"abc");
        bad.checksum = checksum_bytes(b"xyz");
        assert_eq!(r.store(&bad, b"abc").await.unwrap(), StoreOutcome::ChecksumMismatch);
        assert!(!r.is_complete().await);
        assert!(r.assemble().await.is_err());

        r.store(&header(0, b"abc"), b"abc").await.unwrap();
        let file = r.assemble().await.unwrap();
        assert_eq!(file.checksum_mismatches, 1);
    }

    #[tokio::test]
    async fn duplicate_index_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let r = Reassembler::new(dir.path());
        r.begin(&metadata(2, 6)).await.unwrap();
        r.store(&header(0, b"abc"), b"abc").await.unwrap();
        assert_eq!(
            r.store(&header(0, b"abc"), b"abc").await.unwrap(),
            StoreOutcome::Duplicate
        );
        assert_eq!(r.received_count().await, 1);
    }

    #[tokio::test]
    async fn chunk_before_metadata_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let r = Reassembler::new(dir.path());
        assert!(matches!(
            r.store(&header(0, b"a"), b"a").await,
            Err(DataChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn index_out_of_range_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let r = Reassembler::new(dir.path());
        r.begin(&metadata(1, 1)).await.unwrap();
        assert!(r.store(&header(5, b"a"), b"a").await.is_err());
    }

    #[tokio::test]
    async fn conflicting_metadata_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let r = Reassembler::new(dir.path());
        r.begin(&metadata(1, 1)).await.unwrap();
        r.begin(&metadata(1, 1)).await.unwrap();

        let mut other = metadata(1, 1);
        other.transfer_id = "t2".into();
        assert!(matches!(r.begin(&other).await, Err(DataChannelError::Protocol(_))));
    }

    #[tokio::test]
    async fn traversal_file_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let r = Reassembler::new(dir.path());
        let mut evil = metadata(1, 1);
        evil.file_name = "../../etc/passwd".into();
        assert!(matches!(r.begin(&evil).await, Err(DataChannelError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn empty_transfer_is_complete_on_announce() {
        let dir = tempfile::tempdir().unwrap();
        let r = Reassembler::new(dir.path());
        r.begin(&metadata(0, 0)).await.unwrap();
        r.wait_complete().await;
        let file = r.assemble().await.unwrap();
        assert_eq!(std::fs::read(&file.path).unwrap(), b"");
    }

    #[tokio::test]
    async fn nested_file_name_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let r = Reassembler::new(dir.path());
        let mut meta = metadata(1, 3);
        meta.file_name = "backups/disk.img".into();
        r.begin(&meta).await.unwrap();
        r.store(&header(0, b"abc"), b"abc").await.unwrap();
        let file = r.assemble().await.unwrap();
        assert_eq!(file.path, dir.path().join("backups/disk.img"));
        assert_eq!(std::fs::read(&file.path).unwrap(), b"abc");
    }
}
