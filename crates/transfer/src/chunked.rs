use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::types::Chunk;
use crate::{DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE, TransferError};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Byte sources
// ---------------------------------------------------------------------------

/// Provider of the stream to transfer.
pub trait ByteSource: Send + Sync {
    /// Name announced to the receiver and used to build chunk ids.
    fn name(&self) -> &str;

    /// Opens the stream and returns it with its total size in bytes.
    fn open(&self) -> Result<(Box<dyn Read + Send>, u64), TransferError>;
}

/// A file on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: String,
}

impl FileSource {
    /// Uses the file name component of `path` as the transfer name.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "received_file".into());
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<(Box<dyn Read + Send>, u64), TransferError> {
        let unavailable =
            |e: std::io::Error| TransferError::SourceUnavailable(format!("{}: {e}", self.path.display()));
        let file = std::fs::File::open(&self.path).map_err(unavailable)?;
        let size = file.metadata().map_err(unavailable)?.len();
        Ok((Box::new(file), size))
    }
}

/// An in-memory buffer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

impl ByteSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<(Box<dyn Read + Send>, u64), TransferError> {
        let len = self.data.len() as u64;
        Ok((Box::new(std::io::Cursor::new(Arc::clone(&self.data))), len))
    }
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads a stream in fixed-size chunks with automatic SHA-256 checksums.
pub struct ChunkReader<R> {
    reader: R,
    file_name: String,
    chunk_size: usize,
    total_size: u64,
    bytes_read: u64,
    next_index: u32,
    buf: Vec<u8>,
}

impl<R: Read> ChunkReader<R> {
    /// Wraps `reader`.
    ///
    /// A `chunk_size` of 0 selects [`DEFAULT_CHUNK_SIZE`]; anything below
    /// [`MIN_CHUNK_SIZE`] is raised to it.
    pub fn new(reader: R, file_name: impl Into<String>, total_size: u64, chunk_size: usize) -> Self {
        let chunk_size = effective_chunk_size(chunk_size);
        Self {
            reader,
            file_name: file_name.into(),
            chunk_size,
            total_size,
            bytes_read: 0,
            next_index: 0,
            buf: vec![0u8; chunk_size],
        }
    }

    /// Reads the next chunk. Returns `None` at EOF.
    ///
    /// Every chunk except the last is exactly `chunk_size` bytes, whatever
    /// the underlying reader's short-read behavior.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let n = self.fill_buf()?;
        if n == 0 {
            return Ok(None);
        }

        let index = self.next_index;
        let chunk = Chunk::new(
            Chunk::make_id(&self.file_name, index),
            index,
            self.buf[..n].to_vec(),
        );
        self.next_index += 1;
        self.bytes_read += n as u64;
        Ok(Some(chunk))
    }

    /// `floor(bytes_read * 100 / total_size)`, capped at 100.
    pub fn percent(&self) -> u8 {
        if self.total_size == 0 {
            return 100;
        }
        (self.bytes_read.saturating_mul(100) / self.total_size).min(100) as u8
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    fn fill_buf(&mut self) -> Result<usize, TransferError> {
        let mut filled = 0;
        while filled < self.chunk_size {
            match self.reader.read(&mut self.buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransferError::Io(e)),
            }
        }
        Ok(filled)
    }
}

/// Resolves a requested chunk size against the default and the floor.
pub(crate) fn effective_chunk_size(requested: usize) -> usize {
    if requested == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        requested.max(MIN_CHUNK_SIZE)
    }
}

/// Splits `source` into its ordered chunk list.
///
/// `progress` receives the read percentage after each chunk. On a read
/// failure the partial list is dropped and the error returned.
pub fn chunk_source(
    source: &dyn ByteSource,
    chunk_size: usize,
    mut progress: Option<&mut (dyn FnMut(u8) + Send)>,
) -> Result<Vec<Arc<Chunk>>, TransferError> {
    let (reader, total_size) = source.open()?;
    let mut reader = ChunkReader::new(reader, source.name(), total_size, chunk_size);

    let mut chunks = Vec::new();
    while let Some(chunk) = reader.next_chunk()? {
        chunks.push(Arc::new(chunk));
        if let Some(cb) = progress.as_deref_mut() {
            cb(reader.percent());
        }
    }

    debug!(
        name = source.name(),
        chunks = chunks.len(),
        bytes = reader.bytes_read(),
        chunk_size = reader.chunk_size(),
        "source chunked"
    );
    Ok(chunks)
}
