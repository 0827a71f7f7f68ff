//! paktools: pak container archive engine
//!
//! Reads, verifies, extracts and rebuilds packed file collections:
//! - Indexed container format with per-entry LZ4/Zstd compression and
//!   CRC32 or SHA-256 digests over the uncompressed bytes, plus a CRC32 of
//!   the stored bytes checked before decompression
//! - Positional reads, so one opened archive serves concurrent readers
//! - Header-last writes, so an interrupted build is never mistaken for a
//!   valid archive
//! - Whole-archive extraction and rebuild with per-entry failure reporting
//! - The flat chained pak layout of the original packing tool, with
//!   Shift_JIS file names
//!
//! # Example
//!
//! ```no_run
//! use paktools::{ArchiveReader, ArchiveWriter, BuildConfig, CompressionMethod};
//!
//! // Create an archive
//! let config = BuildConfig::default().with_compression(CompressionMethod::Zstd);
//! let mut writer = ArchiveWriter::create("example.pak", config)?;
//! writer.add_entry("data/hello.txt", b"Hello, World!")?;
//! writer.finalize()?;
//!
//! // Read from archive
//! let reader = ArchiveReader::open_path("example.pak")?;
//! let data = reader.read_entry("data/hello.txt")?;
//! assert_eq!(data, b"Hello, World!");
//! # Ok::<(), paktools::PakError>(())
//! ```

// Core modules
pub mod archive;
pub mod cancel;
pub mod config;
pub mod error;
pub mod legacy;
pub mod session;

// Re-export commonly used types
pub use archive::{
    ArchiveHeader, ArchiveReader, ArchiveWriter, BuildState, ChecksumAlgorithm, CommitResult,
    CompressionMethod, ContainerIndex, Digest, EntryDescriptor, EntryStream, ReadAt,
    ReplacePolicy, FORMAT_VERSION_MAJOR, FORMAT_VERSION_MINOR, HEADER_SIZE, MAGIC_NUMBER,
    MAX_PATH_LENGTH,
};
pub use cancel::CancelToken;
pub use config::{BuildConfig, OverwritePolicy, PakConfig, PakFormat, SessionOptions};
pub use error::{ErrorClass, PakError, Result};
pub use legacy::{write_legacy, LegacyEntry, LegacyPak, LegacyWriter};
pub use session::{
    build, detect_format, extract, extract_all, list, rebuild_from, BatchReport, EntryFailure,
    ListedEntry,
};
