//! Checksum and compression primitives applied to entry payloads
//!
//! Everything here is stateless. Digests always cover the uncompressed bytes
//! of an entry, so the same content yields the same digest regardless of the
//! compression method it was stored with.

use crate::archive::format::{ChecksumAlgorithm, CompressionMethod};
use crate::error::{PakError, Result};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::{self, Read, Write};

/// Zstd level used for all entries (balanced speed/ratio)
pub const ZSTD_LEVEL: i32 = 6;

/// Fixed-width integrity digest of an entry's uncompressed bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Digest {
    Crc32(u32),
    Sha256([u8; 32]),
}

impl Digest {
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        match self {
            Digest::Crc32(_) => ChecksumAlgorithm::Crc32,
            Digest::Sha256(_) => ChecksumAlgorithm::Sha256,
        }
    }

    /// Stored representation (little-endian for CRC32)
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Digest::Crc32(crc) => crc.to_le_bytes().to_vec(),
            Digest::Sha256(hash) => hash.to_vec(),
        }
    }

    pub fn from_bytes(algorithm: ChecksumAlgorithm, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != algorithm.digest_len() {
            return Err(PakError::MalformedIndex(format!(
                "digest is {} bytes, expected {}",
                bytes.len(),
                algorithm.digest_len()
            )));
        }
        Ok(match algorithm {
            ChecksumAlgorithm::Crc32 => {
                Digest::Crc32(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            ChecksumAlgorithm::Sha256 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(bytes);
                Digest::Sha256(hash)
            }
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Digest::Crc32(crc) => write!(f, "{:08x}", crc),
            Digest::Sha256(hash) => f.write_str(&hex::encode(hash)),
        }
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({:?}, {})", self.algorithm(), self)
    }
}

/// Compute the digest of a complete buffer
pub fn digest(bytes: &[u8], algorithm: ChecksumAlgorithm) -> Digest {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(bytes);
    hasher.finalize()
}

/// Incremental digest for streamed payloads
pub enum Hasher {
    Crc32(crc32fast::Hasher),
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Crc32 => Hasher::Crc32(crc32fast::Hasher::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Crc32(h) => h.update(bytes),
            Hasher::Sha256(h) => h.update(bytes),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Hasher::Crc32(h) => Digest::Crc32(h.finalize()),
            Hasher::Sha256(h) => Digest::Sha256(h.finalize().into()),
        }
    }
}

/// Compress a complete buffer
pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Lz4 => {
            let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
            encoder.write_all(data)?;
            encoder.finish().map_err(lz4_error)
        }
        CompressionMethod::Zstd => Ok(zstd::encode_all(data, ZSTD_LEVEL)?),
    }
}

/// Decompress a complete buffer, requiring exactly `expected_len` output bytes
///
/// Output is capped one byte past `expected_len`, so a payload that inflates
/// beyond its declared size fails without being fully materialized.
pub fn decompress(data: &[u8], method: CompressionMethod, expected_len: u64) -> Result<Vec<u8>> {
    if method == CompressionMethod::None {
        if data.len() as u64 != expected_len {
            return Err(PakError::corrupt(
                "",
                format!(
                    "stored length {} does not match expected {}",
                    data.len(),
                    expected_len
                ),
            ));
        }
        return Ok(data.to_vec());
    }

    let decoder = decoder(data, method).map_err(|e| PakError::corrupt("", e.to_string()))?;
    let capacity = usize::try_from(expected_len).unwrap_or(usize::MAX).min(1 << 26);
    let mut output = Vec::with_capacity(capacity);
    decoder
        .take(expected_len.saturating_add(1))
        .read_to_end(&mut output)
        .map_err(|e| PakError::corrupt("", format!("{} decoding failed: {}", method.name(), e)))?;

    if output.len() as u64 != expected_len {
        let reason = if output.len() as u64 > expected_len {
            format!("payload inflates past its declared {} bytes", expected_len)
        } else {
            format!("decompressed to {} bytes, expected {}", output.len(), expected_len)
        };
        return Err(PakError::corrupt("", reason));
    }
    Ok(output)
}

/// Wrap a reader of stored bytes in the matching decompressor
pub fn decoder<'a, R: Read + 'a>(reader: R, method: CompressionMethod) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match method {
        CompressionMethod::None => Box::new(reader),
        CompressionMethod::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
        CompressionMethod::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
    })
}

/// Wrap a writer in the matching compressor
pub fn encoder<W: Write>(writer: W, method: CompressionMethod) -> Result<Encoder<W>> {
    Encoder::new(writer, method)
}

/// Streaming compressor; call [`Encoder::finish`] to flush trailing frames
pub enum Encoder<W: Write> {
    Stored(W),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    pub fn new(writer: W, method: CompressionMethod) -> Result<Self> {
        Ok(match method {
            CompressionMethod::None => Encoder::Stored(writer),
            CompressionMethod::Lz4 => Encoder::Lz4(lz4_flex::frame::FrameEncoder::new(writer)),
            CompressionMethod::Zstd => {
                Encoder::Zstd(zstd::stream::write::Encoder::new(writer, ZSTD_LEVEL)?)
            }
        })
    }

    pub fn finish(self) -> Result<W> {
        match self {
            Encoder::Stored(writer) => Ok(writer),
            Encoder::Lz4(encoder) => encoder.finish().map_err(lz4_error),
            Encoder::Zstd(encoder) => Ok(encoder.finish()?),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Stored(w) => w.write(buf),
            Encoder::Lz4(w) => w.write(buf),
            Encoder::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Stored(w) => w.flush(),
            Encoder::Lz4(w) => w.flush(),
            Encoder::Zstd(w) => w.flush(),
        }
    }
}

fn lz4_error(err: lz4_flex::frame::Error) -> PakError {
    PakError::Io(io::Error::new(io::ErrorKind::Other, err.to_string()))
}
