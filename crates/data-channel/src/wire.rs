//! TCP wire format for chunked transfers.
//!
//! All integers are big-endian. Strings are a signed 32-bit byte length
//! followed by UTF-8 bytes.
//!
//! ```text
//! METADATA (once per connection, sender -> receiver):
//!   [4 bytes: transfer_id_len] [transfer_id UTF-8]
//!   [4 bytes: file_name_len]   [file_name UTF-8]
//!   [8 bytes: file_size]
//!   [4 bytes: total_chunks]
//!
//! PER CHUNK (sender -> receiver):
//!   [4 bytes: chunk_id_len]    [chunk_id UTF-8]
//!   [4 bytes: checksum_len]    [checksum ASCII hex]
//!   [4 bytes: index]
//!   [4 bytes: size]
//!   [size bytes: payload]
//! ```
//!
//! There is no end marker: the sender closes the connection when its
//! queue is drained and the transfer is closed.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use multilink_transfer::Chunk;

use crate::error::DataChannelError;
use crate::{MAX_CHUNK_SIZE, MAX_STRING_LEN};

/// Transfer announcement sent at the start of every channel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMetadata {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
}

/// Header preceding a chunk payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_id: String,
    /// Hex SHA-256 of the payload.
    pub checksum: String,
    pub index: u32,
    pub size: u32,
}

impl ChunkHeader {
    /// Builds the header describing `chunk`.
    pub fn for_chunk(chunk: &Chunk) -> Result<Self, DataChannelError> {
        let size = u32::try_from(chunk.size())
            .ok()
            .filter(|s| *s as usize <= MAX_CHUNK_SIZE)
            .ok_or_else(|| {
                DataChannelError::Protocol(format!("chunk too large: {} bytes", chunk.size()))
            })?;
        Ok(Self {
            chunk_id: chunk.id().to_string(),
            checksum: chunk.checksum().to_string(),
            index: chunk.index(),
            size,
        })
    }
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

/// Writes a length-prefixed UTF-8 string.
pub async fn write_string<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &str,
) -> Result<(), DataChannelError> {
    let bytes = value.as_bytes();
    if bytes.len() > MAX_STRING_LEN {
        return Err(DataChannelError::Protocol(format!(
            "string too long: {} bytes (max {MAX_STRING_LEN})",
            bytes.len()
        )));
    }
    writer.write_i32(bytes.len() as i32).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

/// Reads a length-prefixed UTF-8 string.
pub async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, DataChannelError> {
    let len = reader.read_i32().await?;
    read_string_body(reader, len).await
}

async fn read_string_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: i32,
) -> Result<String, DataChannelError> {
    let len = usize::try_from(len)
        .map_err(|_| DataChannelError::Protocol(format!("negative string length: {len}")))?;
    if len > MAX_STRING_LEN {
        return Err(DataChannelError::Protocol(format!(
            "string too long: {len} bytes (max {MAX_STRING_LEN})"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|e| DataChannelError::Protocol(format!("invalid UTF-8 string: {e}")))
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

pub async fn write_metadata<W: AsyncWrite + Unpin>(
    writer: &mut W,
    metadata: &TransferMetadata,
) -> Result<(), DataChannelError> {
    let file_size = i64::try_from(metadata.file_size).map_err(|_| {
        DataChannelError::Protocol(format!("file too large: {} bytes", metadata.file_size))
    })?;
    let total_chunks = i32::try_from(metadata.total_chunks).map_err(|_| {
        DataChannelError::Protocol(format!("too many chunks: {}", metadata.total_chunks))
    })?;

    write_string(writer, &metadata.transfer_id).await?;
    write_string(writer, &metadata.file_name).await?;
    writer.write_i64(file_size).await?;
    writer.write_i32(total_chunks).await?;
    Ok(())
}

pub async fn read_metadata<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<TransferMetadata, DataChannelError> {
    let transfer_id = read_string(reader).await?;
    let file_name = read_string(reader).await?;
    let file_size = reader.read_i64().await?;
    let total_chunks = reader.read_i32().await?;

    Ok(TransferMetadata {
        transfer_id,
        file_name,
        file_size: u64::try_from(file_size)
            .map_err(|_| DataChannelError::Protocol(format!("negative file size: {file_size}")))?,
        total_chunks: u32::try_from(total_chunks).map_err(|_| {
            DataChannelError::Protocol(format!("negative chunk count: {total_chunks}"))
        })?,
    })
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

pub async fn write_chunk_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &ChunkHeader,
) -> Result<(), DataChannelError> {
    let index = i32::try_from(header.index)
        .map_err(|_| DataChannelError::Protocol(format!("chunk index too large: {}", header.index)))?;
    if header.size as usize > MAX_CHUNK_SIZE {
        return Err(DataChannelError::Protocol(format!(
            "chunk too large: {} bytes (max {MAX_CHUNK_SIZE})",
            header.size
        )));
    }

    write_string(writer, &header.chunk_id).await?;
    write_string(writer, &header.checksum).await?;
    writer.write_i32(index).await?;
    writer.write_i32(header.size as i32).await?;
    Ok(())
}

/// Reads a chunk header.
///
/// Returns `None` when the stream ends cleanly before the next frame.
pub async fn read_chunk_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<ChunkHeader>, DataChannelError> {
    let mut len_buf = [0u8; 4];
    let first = reader.read(&mut len_buf[..1]).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[1..]).await?;

    let chunk_id = read_string_body(reader, i32::from_be_bytes(len_buf)).await?;
    let checksum = read_string(reader).await?;
    let index = reader.read_i32().await?;
    let size = reader.read_i32().await?;

    let index = u32::try_from(index)
        .map_err(|_| DataChannelError::Protocol(format!("negative chunk index: {index}")))?;
    let size = u32::try_from(size)
        .ok()
        .filter(|s| *s as usize <= MAX_CHUNK_SIZE)
        .ok_or_else(|| DataChannelError::Protocol(format!("invalid chunk size: {size}")))?;

    Ok(Some(ChunkHeader {
        chunk_id,
        checksum,
        index,
        size,
    }))
}

/// Writes a full chunk frame, `block_size` payload bytes at a time.
///
/// `on_block` receives the cumulative payload bytes written after each
/// block. The writer is flushed before returning.
pub async fn write_chunk_frame<W, F>(
    writer: &mut W,
    header: &ChunkHeader,
    payload: &[u8],
    block_size: usize,
    mut on_block: F,
) -> Result<(), DataChannelError>
where
    W: AsyncWrite + Unpin,
    F: FnMut(usize),
{
    if payload.len() != header.size as usize {
        return Err(DataChannelError::Protocol(format!(
            "payload length {} does not match header size {}",
            payload.len(),
            header.size
        )));
    }

    write_chunk_header(writer, header).await?;
    let mut written = 0;
    for block in payload.chunks(block_size.max(1)) {
        writer.write_all(block).await?;
        written += block.len();
        on_block(written);
    }
    writer.flush().await?;
    Ok(())
}

/// Reads a chunk payload of `size` bytes.
pub async fn read_chunk_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    size: u32,
) -> Result<Vec<u8>, DataChannelError> {
    let mut payload = vec![0u8; size as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> TransferMetadata {
        TransferMetadata {
            transfer_id: "3f2a".into(),
            file_name: "video.mp4".into(),
            file_size: 1_048_576,
            total_chunks: 2,
        }
    }

    #[tokio::test]
    async fn metadata_roundtrip() {
        let mut buf = Vec::new();
        write_metadata(&mut buf, &sample_metadata()).await.unwrap();

        // 4+4 + 4+9 + 8 + 4
        assert_eq!(buf.len(), 33);

        let mut cursor = &buf[..];
        assert_eq!(read_metadata(&mut cursor).await.unwrap(), sample_metadata());
        assert!(cursor.is_empty());
    }

    #[tokio::test]
    async fn chunk_frame_roundtrip() {
        let chunk = Chunk::new("video.mp4_chunk_1", 1, b"hello world".to_vec());
        let header = ChunkHeader::for_chunk(&chunk).unwrap();

        let mut buf = Vec::new();
        let mut reports = Vec::new();
        write_chunk_frame(&mut buf, &header, chunk.payload(), 4, |n| reports.push(n))
            .await
            .unwrap();
        assert_eq!(reports, vec![4, 8, 11]);

        let mut cursor = &buf[..];
        let parsed = read_chunk_header(&mut cursor).await.unwrap().unwrap();
        assert_eq!(parsed, header);
        let payload = read_chunk_payload(&mut cursor, parsed.size).await.unwrap();
        assert_eq!(payload, b"hello world");
        assert!(read_chunk_header(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut cursor: &[u8] = &[];
        assert!(read_chunk_header(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_header_is_an_error() {
        let mut cursor: &[u8] = &[0x00, 0x00];
        assert!(read_chunk_header(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn negative_string_length_rejected() {
        let buf = (-1i32).to_be_bytes();
        let mut cursor = &buf[..];
        let err = read_string(&mut cursor).await.unwrap_err();
        assert!(matches!(err, DataChannelError::Protocol(_)));
    }

    #[tokio::test]
    async fn oversized_string_rejected() {
        let buf = ((MAX_STRING_LEN + 1) as i32).to_be_bytes();
        let mut cursor = &buf[..];
        assert!(matches!(
            read_string(&mut cursor).await,
            Err(DataChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn oversized_chunk_rejected() {
        let mut buf = Vec::new();
        write_string(&mut buf, "c").await.unwrap();
        write_string(&mut buf, "").await.unwrap();
        buf.extend_from_slice(&0i32.to_be_bytes());
        buf.extend_from_slice(&((MAX_CHUNK_SIZE + 1) as i32).to_be_bytes());

        let mut cursor = &buf[..];
        assert!(matches!(
            read_chunk_header(&mut cursor).await,
            Err(DataChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn payload_must_match_header() {
        let header = ChunkHeader {
            chunk_id: "c".into(),
            checksum: String::new(),
            index: 0,
            size: 10,
        };
        let mut buf = Vec::new();
        let err = write_chunk_frame(&mut buf, &header, b"short", 8, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DataChannelError::Protocol(_)));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn empty_payload_writes_header_only() {
        let header = ChunkHeader {
            chunk_id: "e".into(),
            checksum: String::new(),
            index: 3,
            size: 0,
        };
        let mut buf = Vec::new();
        let mut calls = 0;
        write_chunk_frame(&mut buf, &header, &[], 8, |_| calls += 1)
            .await
            .unwrap();
        assert_eq!(calls, 0);
        assert_eq!(buf.len(), 4 + 1 + 4 + 4 + 4);
    }
}
