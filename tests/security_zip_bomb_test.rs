//! Decompression bomb handling
//!
//! Declared uncompressed lengths bound decompression: a payload that inflates
//! past its declared size fails as soon as the excess is seen.

use paktools::archive::codec::{compress, digest};
use paktools::{
    ArchiveHeader, ArchiveReader, ArchiveWriter, BuildConfig, ChecksumAlgorithm,
    CompressionMethod, ContainerIndex, EntryDescriptor, PakError, ReplacePolicy, HEADER_SIZE,
};
use std::io::Cursor;

/// Assemble a container holding one pre-compressed payload with a chosen
/// declared uncompressed length
fn craft_archive(stored: &[u8], method: CompressionMethod, declared_len: u64) -> Vec<u8> {
    let mut index = ContainerIndex::new(true, ChecksumAlgorithm::Crc32);
    index.insert_or_replace(
        EntryDescriptor {
            path: "bomb.bin".to_string(),
            offset: HEADER_SIZE as u64,
            stored_len: stored.len() as u64,
            uncompressed_len: declared_len,
            compression: method,
            stored_crc: crc32fast::hash(stored),
            digest: digest(b"irrelevant", ChecksumAlgorithm::Crc32),
        },
        ReplacePolicy::Append,
    );
    let index_bytes = index.serialize();

    let mut header = ArchiveHeader::new();
    header.entry_count = 1;
    header.index_offset = (HEADER_SIZE + stored.len()) as u64;
    header.index_length = index_bytes.len() as u64;
    header.index_crc = crc32fast::hash(&index_bytes);

    let mut bytes = header.to_bytes().to_vec();
    bytes.extend_from_slice(stored);
    bytes.extend_from_slice(&index_bytes);
    bytes
}

#[test]
fn test_legitimate_highly_compressible_data() {
    println!("\n💣 Testing legitimate highly compressible data (10MB zeros)...");
    let zeros = vec![0u8; 10 * 1024 * 1024];

    let config = BuildConfig::default().with_compression(CompressionMethod::Zstd);
    let mut writer = ArchiveWriter::begin(Cursor::new(Vec::new()), config).unwrap();
    writer.add_entry("zeros.bin", &zeros).unwrap();
    writer.finalize().unwrap();

    let reader = ArchiveReader::open(writer.into_inner().unwrap().into_inner()).unwrap();
    let entry = reader.entry("zeros.bin").unwrap();
    println!(
        "  Compressed {} -> {} bytes",
        entry.uncompressed_len, entry.stored_len
    );
    assert!(entry.stored_len * 100 < entry.uncompressed_len);
    assert_eq!(reader.read_entry("zeros.bin").unwrap(), zeros);
}

#[test]
fn test_inflation_past_declared_length_rejected() {
    for method in [CompressionMethod::Lz4, CompressionMethod::Zstd] {
        let stored = compress(&vec![0u8; 8 * 1024 * 1024], method).unwrap();
        let bytes = craft_archive(&stored, method, 1024);
        let reader = ArchiveReader::open(bytes).unwrap();

        match reader.read_entry("bomb.bin") {
            Err(PakError::CorruptPayload { path, reason }) => {
                assert_eq!(path, "bomb.bin");
                assert!(reason.contains("1024"), "{}", reason);
            }
            other => panic!("{:?}: expected CorruptPayload, got {:?}", method, other),
        }
    }
}

#[test]
fn test_streaming_stops_at_declared_length() {
    let stored = compress(&vec![7u8; 4 * 1024 * 1024], CompressionMethod::Zstd).unwrap();
    let bytes = craft_archive(&stored, CompressionMethod::Zstd, 100_000);
    let reader = ArchiveReader::open(bytes).unwrap();

    let mut produced = 0usize;
    let mut saw_error = false;
    for chunk in reader.stream_entry("bomb.bin").unwrap() {
        match chunk {
            Ok(chunk) => produced += chunk.len(),
            Err(PakError::CorruptPayload { .. }) => {
                saw_error = true;
                break;
            }
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert!(saw_error);
    assert!(produced <= 100_000);
}

#[test]
fn test_short_payload_rejected() {
    let stored = compress(b"only a little data", CompressionMethod::Lz4).unwrap();
    let bytes = craft_archive(&stored, CompressionMethod::Lz4, 1_000_000);
    let reader = ArchiveReader::open(bytes).unwrap();
    assert!(matches!(
        reader.read_entry("bomb.bin"),
        Err(PakError::CorruptPayload { .. })
    ));
}

#[test]
fn test_stored_length_must_match_for_uncompressed() {
    let bytes = craft_archive(b"abcdef", CompressionMethod::None, 3);
    let reader = ArchiveReader::open(bytes).unwrap();
    assert!(matches!(
        reader.read_entry("bomb.bin"),
        Err(PakError::CorruptPayload { .. })
    ));
}
