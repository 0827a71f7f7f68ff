//! Generate seed corpus for fuzzing

use paktools::{write_legacy, ArchiveWriter, BuildConfig, ChecksumAlgorithm, CompressionMethod};
use std::fs::{self, File};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let corpus_dir = "fuzz/corpus/fuzz_archive_parse";
    fs::create_dir_all(corpus_dir)?;

    println!("Generating seed corpus...");

    // Seed 1: Empty archive (no entries)
    {
        let path = format!("{}/seed_empty.pak", corpus_dir);
        let mut writer = ArchiveWriter::create(&path, BuildConfig::default())?;
        writer.finalize()?;
        println!("✓ Generated: {}", path);
    }

    // Seed 2: Multiple entries, one per compression method
    {
        let path = format!("{}/seed_methods.pak", corpus_dir);
        let mut writer = ArchiveWriter::create(&path, BuildConfig::default())?;
        let text = b"This is test data for compression. ".repeat(100);
        writer.add_entry_with("none.txt", &text, CompressionMethod::None)?;
        writer.add_entry_with("lz4.txt", &text, CompressionMethod::Lz4)?;
        writer.add_entry_with("dir/zstd.txt", &text, CompressionMethod::Zstd)?;
        writer.finalize()?;
        println!("✓ Generated: {}", path);
    }

    // Seed 3: SHA-256 digests, case-insensitive
    {
        let path = format!("{}/seed_sha256.pak", corpus_dir);
        let config = BuildConfig::default()
            .with_checksum(ChecksumAlgorithm::Sha256)
            .with_case_sensitive(false);
        let mut writer = ArchiveWriter::create(&path, config)?;
        let binary_data: Vec<u8> = (0..=255).collect();
        writer.add_entry("Binary.bin", &binary_data)?;
        writer.add_entry("empty.txt", b"")?;
        writer.finalize()?;
        println!("✓ Generated: {}", path);
    }

    // Seed 4: Legacy pak
    {
        let path = format!("{}/seed_legacy.pak", corpus_dir);
        write_legacy(
            File::create(&path)?,
            [("README.TXT", &b"Hello, World!"[..]), ("EMPTY.BIN", &b""[..])],
        )?;
        println!("✓ Generated: {}", path);
    }

    println!("\nGenerated 4 seed files in {}", corpus_dir);
    Ok(())
}
