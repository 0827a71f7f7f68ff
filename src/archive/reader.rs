use crate::archive::codec::{self, Digest, Hasher};
use crate::archive::format::{ArchiveHeader, CompressionMethod, HEADER_SIZE};
use crate::archive::index::{ContainerIndex, EntryDescriptor};
use crate::archive::storage::{take_storage_fault, RangeReader, ReadAt};
use crate::cancel::CancelToken;
use crate::error::{PakError, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// Chunk size used by [`EntryStream`]
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// An opened container: the storage it was read from plus its parsed index
///
/// All read operations take `&self` and use positional reads, so a reader
/// over a `File` can be shared between threads.
pub struct ArchiveReader<S: ReadAt = File> {
    storage: S,
    header: ArchiveHeader,
    index: ContainerIndex,
    storage_len: u64,
}

impl ArchiveReader<File> {
    /// Open a container file for reading
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opening archive");
        Self::open(file)
    }
}

impl<S: ReadAt> ArchiveReader<S> {
    /// Read and validate the header and index of `storage`
    pub fn open(storage: S) -> Result<Self> {
        let storage_len = storage.len()?;
        if storage_len < HEADER_SIZE as u64 {
            return Err(PakError::truncated(
                "archive header",
                HEADER_SIZE as u64,
                storage_len,
            ));
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        storage.read_exact_at(0, &mut header_bytes)?;
        let header = ArchiveHeader::from_bytes(&header_bytes)?;

        if header.index_offset < HEADER_SIZE as u64 {
            return Err(PakError::MalformedIndex(format!(
                "index offset {} overlaps the header",
                header.index_offset
            )));
        }
        let index_end = header
            .index_offset
            .checked_add(header.index_length)
            .ok_or_else(|| PakError::MalformedIndex("index range overflows".to_string()))?;
        if index_end > storage_len {
            return Err(PakError::truncated("index region", index_end, storage_len));
        }

        let index_len = usize::try_from(header.index_length)
            .map_err(|_| PakError::MalformedIndex("index too large".to_string()))?;
        let mut index_bytes = vec![0u8; index_len];
        storage.read_exact_at(header.index_offset, &mut index_bytes)?;
        let index = ContainerIndex::parse(&header_bytes, &index_bytes)?;

        for entry in index.iter() {
            let end = entry.end_offset().ok_or_else(|| {
                PakError::MalformedIndex(format!("payload range of {} overflows", entry.path))
            })?;
            if end > storage_len {
                return Err(PakError::truncated(
                    format!("payload of {}", entry.path),
                    end,
                    storage_len,
                ));
            }
            if end > header.index_offset {
                return Err(PakError::MalformedIndex(format!(
                    "payload of {} overlaps the index region",
                    entry.path
                )));
            }
        }

        info!(
            entries = index.len(),
            version = %format!("{}.{}", header.version_major, header.version_minor),
            "archive opened"
        );

        Ok(Self {
            storage,
            header,
            index,
            storage_len,
        })
    }

    /// Get archive header information
    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    pub fn index(&self) -> &ContainerIndex {
        &self.index
    }

    /// Get number of entries in archive
    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    /// Size of the underlying storage when it was opened
    pub fn storage_len(&self) -> u64 {
        self.storage_len
    }

    /// Entries in index order; call again to restart
    pub fn entries(&self) -> std::slice::Iter<'_, EntryDescriptor> {
        self.index.iter()
    }

    /// Check if an entry exists in the archive
    pub fn contains(&self, path: &str) -> bool {
        self.index.contains(path)
    }

    /// Get entry information without reading data
    pub fn entry(&self, path: &str) -> Option<&EntryDescriptor> {
        self.index.get(path)
    }

    /// Read, decompress and verify one entry
    pub fn read_entry(&self, path: &str) -> Result<Vec<u8>> {
        let entry = self.index.resolve(path)?;
        self.read_descriptor(entry)
    }

    /// Read an entry whose descriptor is already at hand
    pub fn read_descriptor(&self, entry: &EntryDescriptor) -> Result<Vec<u8>> {
        debug!(path = %entry.path, offset = entry.offset, stored = entry.stored_len, "reading entry");

        let stored_len = usize::try_from(entry.stored_len)
            .map_err(|_| PakError::corrupt(&entry.path, "stored length exceeds address space"))?;
        let mut stored = vec![0u8; stored_len];
        self.storage.read_exact_at(entry.offset, &mut stored)?;
        verify_stored_crc(entry, crc32fast::hash(&stored))?;

        let data = codec::decompress(&stored, entry.compression, entry.uncompressed_len)
            .map_err(|e| e.at_path(&entry.path))?;

        let actual = codec::digest(&data, entry.digest.algorithm());
        verify_digest(&entry.path, entry.digest, actual)?;
        Ok(data)
    }

    /// Stream an entry in chunks without materializing it
    pub fn stream_entry(&self, path: &str) -> Result<EntryStream<'_>> {
        let entry = self.index.resolve(path)?;
        self.stream_descriptor(entry, None)
    }

    /// Like [`stream_entry`](Self::stream_entry), polling `cancel` between chunks
    pub fn stream_entry_with_cancel(
        &self,
        path: &str,
        cancel: &CancelToken,
    ) -> Result<EntryStream<'_>> {
        let entry = self.index.resolve(path)?;
        self.stream_descriptor(entry, Some(cancel.clone()))
    }

    pub fn stream_descriptor<'a>(
        &'a self,
        entry: &'a EntryDescriptor,
        cancel: Option<CancelToken>,
    ) -> Result<EntryStream<'a>> {
        // Raw payloads are fully covered by the digest; encoded ones are
        // checked before any byte reaches the decoder
        if entry.compression != CompressionMethod::None {
            self.check_stored_crc(entry, cancel.as_ref())?;
        }

        let range = RangeReader::new(&self.storage, entry.offset, entry.stored_len);
        let decoder = codec::decoder(range, entry.compression)
            .map_err(|e| PakError::corrupt(&entry.path, e.to_string()))?;

        Ok(EntryStream {
            path: &entry.path,
            // One byte of slack lets an oversized payload be detected
            decoder: Box::new(decoder.take(entry.uncompressed_len.saturating_add(1))),
            hasher: Some(Hasher::new(entry.digest.algorithm())),
            expected_digest: entry.digest,
            expected_len: entry.uncompressed_len,
            produced: 0,
            cancel,
            done: false,
        })
    }

    fn check_stored_crc(&self, entry: &EntryDescriptor, cancel: Option<&CancelToken>) -> Result<()> {
        let mut crc = crc32fast::Hasher::new();
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        let mut offset = entry.offset;
        let mut remaining = entry.stored_len;
        while remaining > 0 {
            if cancel.map_or(false, CancelToken::is_cancelled) {
                return Err(PakError::Cancelled);
            }
            let n = remaining.min(STREAM_CHUNK_SIZE as u64) as usize;
            self.storage.read_exact_at(offset, &mut buf[..n])?;
            crc.update(&buf[..n]);
            offset += n as u64;
            remaining -= n as u64;
        }
        verify_stored_crc(entry, crc.finalize())
    }

    /// Check every entry, returning the failures (empty when the archive is sound)
    pub fn verify_all(&self) -> Vec<PakError> {
        self.entries()
            .filter_map(|entry| {
                self.stream_descriptor(entry, None)
                    .and_then(|stream| stream.copy_to(std::io::sink()))
                    .err()
                    .map(|e| e.for_entry(&entry.path))
            })
            .collect()
    }

    /// Give back the underlying storage
    pub fn into_storage(self) -> S {
        self.storage
    }
}

fn verify_stored_crc(entry: &EntryDescriptor, actual: u32) -> Result<()> {
    if entry.stored_crc != actual {
        return Err(PakError::ChecksumMismatch {
            path: entry.path.clone(),
            expected: format!("{:08x}", entry.stored_crc),
            actual: format!("{:08x}", actual),
        });
    }
    Ok(())
}

fn verify_digest(path: &str, expected: Digest, actual: Digest) -> Result<()> {
    if expected != actual {
        return Err(PakError::ChecksumMismatch {
            path: path.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Chunked reader over one entry's decompressed bytes
///
/// Yields `Ok(chunk)` until the entry is exhausted. Decoding errors surface
/// on the chunk where they occur; length and digest checks happen after the
/// last chunk, so a mismatch arrives as the final item.
pub struct EntryStream<'a> {
    path: &'a str,
    decoder: Box<dyn Read + 'a>,
    hasher: Option<Hasher>,
    expected_digest: Digest,
    expected_len: u64,
    produced: u64,
    cancel: Option<CancelToken>,
    done: bool,
}

impl EntryStream<'_> {
    pub fn path(&self) -> &str {
        self.path
    }

    /// Bytes yielded so far
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Drain the stream into `writer`, returning the number of bytes written
    pub fn copy_to<W: Write>(self, mut writer: W) -> Result<u64> {
        let mut written = 0u64;
        for chunk in self {
            let chunk = chunk?;
            writer.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    fn fill_chunk(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            match self.decoder.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(match take_storage_fault(e) {
                        Ok(io_err) => PakError::Io(io_err),
                        Err(decode_err) => PakError::corrupt(self.path, decode_err.to_string()),
                    })
                }
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn finish(&mut self) -> Result<()> {
        if self.produced != self.expected_len {
            return Err(PakError::corrupt(
                self.path,
                format!(
                    "decompressed to {} bytes, expected {}",
                    self.produced, self.expected_len
                ),
            ));
        }
        match self.hasher.take() {
            Some(hasher) => verify_digest(self.path, self.expected_digest, hasher.finalize()),
            None => Ok(()),
        }
    }
}

impl Iterator for EntryStream<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(cancel) = &self.cancel {
            if let Err(e) = cancel.check() {
                self.done = true;
                return Some(Err(e));
            }
        }

        let chunk = match self.fill_chunk() {
            Ok(chunk) => chunk,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        if chunk.is_empty() {
            self.done = true;
            return self.finish().err().map(Err);
        }

        self.produced += chunk.len() as u64;
        if self.produced > self.expected_len {
            self.done = true;
            return Some(Err(PakError::corrupt(
                self.path,
                format!("payload inflates past its declared {} bytes", self.expected_len),
            )));
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&chunk);
        }
        Some(Ok(chunk))
    }
}
