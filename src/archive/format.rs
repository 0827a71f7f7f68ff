use crate::error::{PakError, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Magic number: 0x89 'P' 'A' 'K' 0x0D 0x0A 0x1A 0x0A
/// Follows PNG pattern for corruption detection
pub const MAGIC_NUMBER: [u8; 8] = [0x89, b'P', b'A', b'K', 0x0D, 0x0A, 0x1A, 0x0A];

/// Current format version
pub const FORMAT_VERSION_MAJOR: u16 = 1;
pub const FORMAT_VERSION_MINOR: u16 = 0;

/// Header size in bytes
pub const HEADER_SIZE: usize = 64;

/// Maximum path length in bytes (UTF-8)
pub const MAX_PATH_LENGTH: usize = 1024;

/// Header flag: path lookups fold ASCII/Unicode case
pub const FLAG_CASE_INSENSITIVE: u32 = 0b1;

/// Bytes of the header covered by the header CRC
const HEADER_CRC_SPAN: usize = 44;

/// Compression methods supported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionMethod {
    #[default]
    None = 0,
    Lz4 = 1,
    Zstd = 2,
}

impl CompressionMethod {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Zstd),
            _ => Err(PakError::UnsupportedMethod(value)),
        }
    }

    /// Choose a method from a file's extension and size
    pub fn choose_for_file(path: &str, size: u64) -> Self {
        // Don't compress small files
        if size < 4096 {
            return Self::None;
        }

        let extension = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            // Already compressed formats
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "mp3" | "mp4" | "ogg" | "zip" | "gz"
            | "7z" | "pak" => Self::None,
            // Text and structured data compress best with Zstd
            "txt" | "md" | "json" | "toml" | "xml" | "csv" | "html" | "css" | "js" | "lua"
            | "ini" | "cfg" => Self::Zstd,
            // Everything else favours decode speed
            _ => Self::Lz4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

/// Integrity digest algorithm, fixed per archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ChecksumAlgorithm {
    #[default]
    Crc32 = 0,
    Sha256 = 1,
}

impl ChecksumAlgorithm {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Crc32),
            1 => Ok(Self::Sha256),
            _ => Err(PakError::MalformedIndex(format!(
                "unknown checksum algorithm {}",
                value
            ))),
        }
    }

    /// Width of a stored digest in bytes
    pub fn digest_len(self) -> usize {
        match self {
            Self::Crc32 => 4,
            Self::Sha256 => 32,
        }
    }
}

/// Archive header at the beginning of the container
///
/// Structure (64 bytes fixed):
/// - Magic (8 bytes)
/// - Version Major / Minor: uint16 each
/// - Flags: uint32
/// - Checksum algorithm: uint8, then 3 reserved bytes
/// - Entry Count: uint32
/// - Index Offset / Index Length: uint64 each
/// - Index CRC32: uint32
/// - Header CRC32: uint32 (over the preceding 44 bytes)
/// - Reserved: 16 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u32,
    pub checksum: ChecksumAlgorithm,
    pub entry_count: u32,
    pub index_offset: u64,
    pub index_length: u64,
    pub index_crc: u32,
}

impl ArchiveHeader {
    pub fn new() -> Self {
        Self {
            version_major: FORMAT_VERSION_MAJOR,
            version_minor: FORMAT_VERSION_MINOR,
            flags: 0,
            checksum: ChecksumAlgorithm::Crc32,
            entry_count: 0,
            index_offset: HEADER_SIZE as u64,
            index_length: 0,
            index_crc: 0,
        }
    }

    pub fn case_sensitive(&self) -> bool {
        self.flags & FLAG_CASE_INSENSITIVE == 0
    }

    pub fn set_case_sensitive(&mut self, case_sensitive: bool) {
        if case_sensitive {
            self.flags &= !FLAG_CASE_INSENSITIVE;
        } else {
            self.flags |= FLAG_CASE_INSENSITIVE;
        }
    }

    /// Serialize to the fixed 64-byte layout
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC_NUMBER);
        buf[8..10].copy_from_slice(&self.version_major.to_le_bytes());
        buf[10..12].copy_from_slice(&self.version_minor.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16] = self.checksum as u8;
        buf[20..24].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[32..40].copy_from_slice(&self.index_length.to_le_bytes());
        buf[40..44].copy_from_slice(&self.index_crc.to_le_bytes());
        let header_crc = crc32fast::hash(&buf[..HEADER_CRC_SPAN]);
        buf[44..48].copy_from_slice(&header_crc.to_le_bytes());
        buf
    }

    /// Write header to a writer
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Parse and validate a header from its raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(PakError::truncated(
                "archive header",
                HEADER_SIZE as u64,
                bytes.len() as u64,
            ));
        }

        if bytes[0..8] != MAGIC_NUMBER {
            return Err(PakError::MalformedIndex(
                "invalid magic number in archive header".to_string(),
            ));
        }

        let version_major = u16::from_le_bytes([bytes[8], bytes[9]]);
        let version_minor = u16::from_le_bytes([bytes[10], bytes[11]]);
        validate_version(version_major, version_minor)?;

        let stored_crc = le_u32(&bytes[44..48]);
        let computed_crc = crc32fast::hash(&bytes[..HEADER_CRC_SPAN]);
        if stored_crc != computed_crc {
            return Err(PakError::MalformedIndex(format!(
                "header CRC mismatch: stored {:08x}, computed {:08x}",
                stored_crc, computed_crc
            )));
        }

        Ok(Self {
            version_major,
            version_minor,
            flags: le_u32(&bytes[12..16]),
            checksum: ChecksumAlgorithm::from_u8(bytes[16])?,
            entry_count: le_u32(&bytes[20..24]),
            index_offset: le_u64(&bytes[24..32]),
            index_length: le_u64(&bytes[32..40]),
            index_crc: le_u32(&bytes[40..44]),
        })
    }

    /// Read header from a reader
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        Self::from_bytes(&buf)
    }
}

impl Default for ArchiveHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Only format major version 1 is understood; newer minors are rejected too
/// since they may add fields this reader would misinterpret.
fn validate_version(major: u16, minor: u16) -> Result<()> {
    if major != FORMAT_VERSION_MAJOR || minor > FORMAT_VERSION_MINOR {
        return Err(PakError::UnsupportedVersion { major, minor });
    }
    Ok(())
}

pub(crate) fn le_u16(bytes: &[u8]) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[..2]);
    u16::from_le_bytes(buf)
}

pub(crate) fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

pub(crate) fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}
