use crate::archive::codec::Digest;
use crate::archive::format::{
    le_u16, le_u32, le_u64, ArchiveHeader, ChecksumAlgorithm, CompressionMethod, HEADER_SIZE,
};
use crate::archive::path::{path_key, validate_path};
use crate::error::{PakError, Result};
use std::collections::HashMap;

/// Signature "ENTR" at the start of every index record
pub const INDEX_RECORD_SIGNATURE: [u8; 4] = [0x45, 0x4E, 0x54, 0x52];

/// Fixed part of an index record, before the path and digest
const RECORD_FIXED_SIZE: usize = 4 + 8 + 8 + 8 + 1 + 1 + 2 + 4;

/// Index metadata for one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDescriptor {
    pub path: String,
    /// Absolute offset of the stored payload within the container
    pub offset: u64,
    pub stored_len: u64,
    pub uncompressed_len: u64,
    pub compression: CompressionMethod,
    /// CRC32 of the stored (possibly compressed) bytes, checked before decoding
    pub stored_crc: u32,
    /// Digest of the uncompressed bytes
    pub digest: Digest,
}

impl EntryDescriptor {
    /// Serialized size of this record in the index region
    pub fn record_size(&self) -> usize {
        RECORD_FIXED_SIZE + self.path.len() + self.digest.algorithm().digest_len()
    }

    /// End of the payload range (exclusive)
    pub fn end_offset(&self) -> Option<u64> {
        self.offset.checked_add(self.stored_len)
    }

    fn write_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&INDEX_RECORD_SIGNATURE);
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.stored_len.to_le_bytes());
        out.extend_from_slice(&self.uncompressed_len.to_le_bytes());
        out.push(self.compression as u8);
        out.push(0);
        out.extend_from_slice(&(self.path.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.stored_crc.to_le_bytes());
        out.extend_from_slice(self.path.as_bytes());
        out.extend_from_slice(&self.digest.to_bytes());
    }

    /// Parse one record at the start of `bytes`, returning it and its size
    fn parse_record(bytes: &[u8], algorithm: ChecksumAlgorithm) -> Result<(Self, usize)> {
        if bytes.len() < RECORD_FIXED_SIZE {
            return Err(PakError::MalformedIndex(
                "truncated index record".to_string(),
            ));
        }
        if bytes[0..4] != INDEX_RECORD_SIGNATURE {
            return Err(PakError::MalformedIndex(
                "invalid index record signature (expected ENTR)".to_string(),
            ));
        }

        let offset = le_u64(&bytes[4..12]);
        let stored_len = le_u64(&bytes[12..20]);
        let uncompressed_len = le_u64(&bytes[20..28]);
        let compression = CompressionMethod::from_u8(bytes[28])?;
        let path_len = le_u16(&bytes[30..32]) as usize;
        let stored_crc = le_u32(&bytes[32..36]);

        let digest_len = algorithm.digest_len();
        let total = RECORD_FIXED_SIZE + path_len + digest_len;
        if bytes.len() < total {
            return Err(PakError::MalformedIndex(
                "truncated index record".to_string(),
            ));
        }

        let path_bytes = &bytes[RECORD_FIXED_SIZE..RECORD_FIXED_SIZE + path_len];
        let path = std::str::from_utf8(path_bytes)
            .map_err(|e| PakError::MalformedIndex(format!("invalid UTF-8 in path: {}", e)))?;
        let path = validate_path(path).map_err(|e| PakError::MalformedIndex(e.to_string()))?;
        if path.as_bytes() != path_bytes {
            return Err(PakError::MalformedIndex(format!(
                "non-canonical path in index: {:?}",
                path
            )));
        }

        let digest = Digest::from_bytes(algorithm, &bytes[RECORD_FIXED_SIZE + path_len..total])?;

        Ok((
            Self {
                path,
                offset,
                stored_len,
                uncompressed_len,
                compression,
                stored_crc,
                digest,
            },
            total,
        ))
    }
}

/// How `insert_or_replace` treats an existing entry with the same path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacePolicy {
    /// Keep the old entry's position (entry order is irrelevant to the build)
    InPlace,
    /// Drop the old entry and append the new one
    Append,
}

/// Ordered table of contents with O(1) path lookup
#[derive(Debug, Clone)]
pub struct ContainerIndex {
    entries: Vec<EntryDescriptor>,
    lookup: HashMap<String, usize>,
    case_sensitive: bool,
    algorithm: ChecksumAlgorithm,
}

impl ContainerIndex {
    pub fn new(case_sensitive: bool, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            entries: Vec::new(),
            lookup: HashMap::new(),
            case_sensitive,
            algorithm,
        }
    }

    /// Parse the index region described by a raw header
    pub fn parse(header_bytes: &[u8], index_bytes: &[u8]) -> Result<Self> {
        let header = ArchiveHeader::from_bytes(header_bytes)?;

        if index_bytes.len() as u64 != header.index_length {
            return Err(PakError::MalformedIndex(format!(
                "index is {} bytes, header declares {}",
                index_bytes.len(),
                header.index_length
            )));
        }

        let computed_crc = crc32fast::hash(index_bytes);
        if computed_crc != header.index_crc {
            return Err(PakError::MalformedIndex(format!(
                "index CRC mismatch: expected {:08x}, got {:08x}",
                header.index_crc, computed_crc
            )));
        }

        // Smallest possible record bounds the entry count before allocating
        let min_record = RECORD_FIXED_SIZE + 1 + header.checksum.digest_len();
        if (header.entry_count as usize).saturating_mul(min_record) > index_bytes.len() {
            return Err(PakError::MalformedIndex(format!(
                "{} entries cannot fit in {} index bytes",
                header.entry_count,
                index_bytes.len()
            )));
        }

        let mut index = Self::new(header.case_sensitive(), header.checksum);
        index.entries.reserve(header.entry_count as usize);

        let mut cursor = 0usize;
        for _ in 0..header.entry_count {
            let (entry, size) =
                EntryDescriptor::parse_record(&index_bytes[cursor..], header.checksum)?;
            cursor += size;

            if entry.offset < HEADER_SIZE as u64 {
                return Err(PakError::MalformedIndex(format!(
                    "entry {} overlaps the header",
                    entry.path
                )));
            }
            let key = path_key(&entry.path, index.case_sensitive);
            if index.lookup.contains_key(&key) {
                return Err(PakError::MalformedIndex(format!(
                    "duplicate path in index: {}",
                    entry.path
                )));
            }
            index.lookup.insert(key, index.entries.len());
            index.entries.push(entry);
        }

        if cursor != index_bytes.len() {
            return Err(PakError::MalformedIndex(format!(
                "{} trailing bytes after {} index records",
                index_bytes.len() - cursor,
                header.entry_count
            )));
        }

        Ok(index)
    }

    /// Deterministic byte encoding of the index region, in entry order
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.iter().map(|e| e.record_size()).sum());
        for entry in &self.entries {
            entry.write_into(&mut out);
        }
        out
    }

    /// Look up an entry by logical path under the index's case policy
    pub fn resolve(&self, path: &str) -> Result<&EntryDescriptor> {
        self.get(path)
            .ok_or_else(|| PakError::NotFound(path.to_string()))
    }

    pub fn get(&self, path: &str) -> Option<&EntryDescriptor> {
        let normalized = crate::archive::path::normalize_path(path);
        self.lookup
            .get(&path_key(&normalized, self.case_sensitive))
            .map(|&i| &self.entries[i])
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Add an entry during assembly, returning the entry it replaced
    pub fn insert_or_replace(
        &mut self,
        descriptor: EntryDescriptor,
        policy: ReplacePolicy,
    ) -> Option<EntryDescriptor> {
        let key = path_key(&descriptor.path, self.case_sensitive);
        match self.lookup.get(&key).copied() {
            None => {
                self.lookup.insert(key, self.entries.len());
                self.entries.push(descriptor);
                None
            }
            Some(position) => match policy {
                ReplacePolicy::InPlace => {
                    Some(std::mem::replace(&mut self.entries[position], descriptor))
                }
                ReplacePolicy::Append => {
                    let old = self.entries.remove(position);
                    self.entries.push(descriptor);
                    self.rebuild_lookup();
                    Some(old)
                }
            },
        }
    }

    /// Reorder entries by path (byte order), for reproducible layouts
    pub fn sort_by_path(&mut self) {
        self.entries.sort_by(|a, b| a.path.cmp(&b.path));
        self.rebuild_lookup();
    }

    fn rebuild_lookup(&mut self) {
        self.lookup = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (path_key(&e.path, self.case_sensitive), i))
            .collect();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EntryDescriptor> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[EntryDescriptor] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [EntryDescriptor] {
        &mut self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn total_stored_len(&self) -> u64 {
        self.entries.iter().map(|e| e.stored_len).sum()
    }
}

impl<'a> IntoIterator for &'a ContainerIndex {
    type Item = &'a EntryDescriptor;
    type IntoIter = std::slice::Iter<'a, EntryDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
