fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use multilink_data_channel::wire::{
        ChunkHeader, TransferMetadata, read_chunk_header, read_chunk_payload, read_metadata,
        write_chunk_frame, write_metadata,
    };
    use multilink_transfer::{Chunk, checksum_bytes};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a hex fixture as raw bytes.
    fn load_fixture(name: &str) -> Vec<u8> {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        hex::decode(data.trim())
            .unwrap_or_else(|e| panic!("failed to decode fixture {}: {e}", path.display()))
    }

    fn fixture_metadata() -> TransferMetadata {
        TransferMetadata {
            transfer_id: "7d3c1a52-0000-4000-8000-000000000001".into(),
            file_name: "holiday.mp4".into(),
            file_size: 10 * 1024 * 1024,
            total_chunks: 20,
        }
    }

    fn fixture_payload() -> Vec<u8> {
        (0..64u32).map(|i| (i * 31 % 256) as u8).collect()
    }

    // --- Metadata frame ---

    #[tokio::test]
    async fn metadata_encoding_matches_fixture() {
        let mut buf = Vec::new();
        write_metadata(&mut buf, &fixture_metadata()).await.unwrap();
        assert_eq!(
            hex::encode(&buf),
            hex::encode(load_fixture("metadata_frame.hex"))
        );
    }

    #[tokio::test]
    async fn metadata_fixture_decodes() {
        let bytes = load_fixture("metadata_frame.hex");
        let mut cursor = &bytes[..];
        assert_eq!(read_metadata(&mut cursor).await.unwrap(), fixture_metadata());
        assert!(cursor.is_empty(), "{} trailing bytes", cursor.len());
    }

    // --- Chunk frame ---

    #[tokio::test]
    async fn chunk_encoding_matches_fixture() {
        let chunk = Chunk::new(Chunk::make_id("holiday.mp4", 13), 13, fixture_payload());
        let header = ChunkHeader::for_chunk(&chunk).unwrap();

        let mut buf = Vec::new();
        write_chunk_frame(&mut buf, &header, chunk.payload(), 8 * 1024, |_| {})
            .await
            .unwrap();
        assert_eq!(hex::encode(&buf), hex::encode(load_fixture("chunk_frame.hex")));
    }

    #[tokio::test]
    async fn chunk_fixture_decodes_and_verifies() {
        let bytes = load_fixture("chunk_frame.hex");
        let mut cursor = &bytes[..];

        let header = read_chunk_header(&mut cursor).await.unwrap().unwrap();
        assert_eq!(header.chunk_id, "holiday.mp4_chunk_13");
        assert_eq!(header.index, 13);
        assert_eq!(header.size, 64);

        let payload = read_chunk_payload(&mut cursor, header.size).await.unwrap();
        assert_eq!(payload, fixture_payload());
        assert_eq!(checksum_bytes(&payload), header.checksum);
        assert!(read_chunk_header(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn block_size_does_not_change_bytes() {
        let chunk = Chunk::new(Chunk::make_id("holiday.mp4", 13), 13, fixture_payload());
        let header = ChunkHeader::for_chunk(&chunk).unwrap();

        let mut small = Vec::new();
        write_chunk_frame(&mut small, &header, chunk.payload(), 7, |_| {})
            .await
            .unwrap();
        assert_eq!(small, load_fixture("chunk_frame.hex"));
    }
}
