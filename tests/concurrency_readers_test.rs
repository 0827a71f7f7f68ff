//! Multi-reader tests
//!
//! One opened archive is shared between threads; every read goes through
//! positional I/O, so concurrent reads of any entries must all succeed.

use paktools::{ArchiveReader, ArchiveWriter, BuildConfig, CompressionMethod};
use std::sync::Arc;
use std::thread;
use tempfile::NamedTempFile;

/// Helper: Create archive with N files
fn create_archive_with_files(file_count: usize, method: CompressionMethod) -> NamedTempFile {
    let temp_file = NamedTempFile::new().unwrap();
    let config = BuildConfig::default().with_compression(method);
    let mut writer = ArchiveWriter::create(temp_file.path(), config).unwrap();
    for i in 0..file_count {
        let filename = format!("dir{}/file{}.txt", i % 5, i);
        writer
            .add_entry(&filename, expected_data(i).as_bytes())
            .unwrap();
    }
    writer.finalize().unwrap();
    temp_file
}

fn expected_data(i: usize) -> String {
    format!("payload for entry {} ", i).repeat(i % 40 + 1)
}

#[test]
fn test_shared_reader_across_threads() {
    let temp_file = create_archive_with_files(100, CompressionMethod::Zstd);
    let reader = Arc::new(ArchiveReader::open_path(temp_file.path()).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let reader = Arc::clone(&reader);
            thread::spawn(move || {
                for round in 0..5 {
                    for i in (t..100).step_by(8) {
                        let path = format!("dir{}/file{}.txt", i % 5, i);
                        let data = reader.read_entry(&path).unwrap();
                        assert_eq!(data, expected_data(i).as_bytes(), "round {}", round);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_same_entry_from_many_threads() {
    let temp_file = create_archive_with_files(10, CompressionMethod::Lz4);
    let reader = ArchiveReader::open_path(temp_file.path()).unwrap();

    thread::scope(|scope| {
        for _ in 0..16 {
            scope.spawn(|| {
                for _ in 0..20 {
                    let data = reader.read_entry("dir3/file3.txt").unwrap();
                    assert_eq!(data, expected_data(3).as_bytes());
                }
            });
        }
    });
}

#[test]
fn test_concurrent_streams() {
    let temp_file = NamedTempFile::new().unwrap();
    let config = BuildConfig::default().with_compression(CompressionMethod::Zstd);
    let mut writer = ArchiveWriter::create(temp_file.path(), config).unwrap();
    let big: Vec<Vec<u8>> = (0..4u8)
        .map(|n| (0..400_000u32).map(|i| (i as u8).wrapping_mul(n + 1)).collect())
        .collect();
    for (n, data) in big.iter().enumerate() {
        writer.add_entry(&format!("big{}.bin", n), data).unwrap();
    }
    writer.finalize().unwrap();

    let reader = ArchiveReader::open_path(temp_file.path()).unwrap();
    thread::scope(|scope| {
        for (n, expected) in big.iter().enumerate() {
            let reader = &reader;
            scope.spawn(move || {
                let mut out = Vec::new();
                reader
                    .stream_entry(&format!("big{}.bin", n))
                    .unwrap()
                    .copy_to(&mut out)
                    .unwrap();
                assert_eq!(&out, expected);
            });
        }
    });
}

#[test]
fn test_independent_readers_same_file() {
    let temp_file = create_archive_with_files(20, CompressionMethod::None);
    let path = temp_file.path().to_path_buf();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            thread::spawn(move || {
                let reader = ArchiveReader::open_path(&path).unwrap();
                assert_eq!(reader.entry_count(), 20);
                assert!(reader.verify_all().is_empty());
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}
