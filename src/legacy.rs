//! Flat chained pak format written by the original packing tool
//!
//! ```text
//! [entry header 0x50][data][pad to 16] ... [terminator header 0x50]
//! ```
//!
//! Entry header (little-endian):
//!
//! | off  | size | field                                  |
//! |------|------|----------------------------------------|
//! | 0x00 | 0x40 | name, Shift_JIS, NUL-terminated        |
//! | 0x40 | 4    | header size (0x50)                     |
//! | 0x44 | 4    | file size                              |
//! | 0x48 | 4    | next header offset, relative to header |
//! | 0x4C | 4    | constant 0x43424140                    |
//!
//! The terminator has an empty name and `0xFFFFFFFF` for both the file size
//! and the next header offset. There is no index and no integrity data.

use crate::archive::format::le_u32;
use crate::archive::storage::{RangeReader, ReadAt};
use crate::error::{PakError, Result};
use encoding_rs::SHIFT_JIS;
use std::borrow::Cow;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Size of every entry header, terminator included
pub const LEGACY_HEADER_SIZE: usize = 0x50;

/// Constant stored in the last field of every header
pub const LEGACY_HEADER_CONST: u32 = 0x4342_4140;

const NAME_FIELD_SIZE: usize = 0x40;
const ALIGNMENT: u64 = 0x10;
const TERMINATOR: u32 = 0xFFFF_FFFF;

/// One file in a legacy pak
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyEntry {
    pub name: String,
    /// Absolute offset of the file data
    pub offset: u64,
    pub size: u64,
}

/// Check a flat legacy file name
pub fn validate_legacy_name(name: &str) -> Result<()> {
    encode_name(name).map(|_| ())
}

/// Validate `name` and return its Shift_JIS bytes
fn encode_name(name: &str) -> Result<Cow<'_, [u8]>> {
    let invalid = |reason| PakError::InvalidPath {
        path: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("empty name"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("legacy paks cannot hold directories"));
    }
    if name.chars().any(char::is_control) {
        return Err(invalid("control character in name"));
    }
    if name == "." || name == ".." {
        return Err(invalid("dot segment"));
    }

    let (encoded, _, had_errors) = SHIFT_JIS.encode(name);
    if had_errors {
        return Err(invalid("name has no Shift_JIS encoding"));
    }
    if encoded.len() >= NAME_FIELD_SIZE {
        return Err(invalid("name longer than 63 bytes"));
    }
    Ok(encoded)
}

fn decode_name(bytes: &[u8], position: u64) -> Result<String> {
    let name = SHIFT_JIS
        .decode_without_bom_handling_and_without_replacement(bytes)
        .ok_or_else(|| {
            PakError::MalformedIndex(format!(
                "name in header at {:#x} is not valid Shift_JIS",
                position
            ))
        })?
        .into_owned();
    validate_legacy_name(&name).map_err(|e| PakError::MalformedIndex(e.to_string()))?;
    Ok(name)
}

/// Opened legacy pak
pub struct LegacyPak<S: ReadAt = File> {
    storage: S,
    entries: Vec<LegacyEntry>,
}

impl LegacyPak<File> {
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opening legacy pak");
        Self::open(file)
    }
}

impl<S: ReadAt> LegacyPak<S> {
    /// Walk the header chain up to the terminator
    pub fn open(storage: S) -> Result<Self> {
        let storage_len = storage.len()?;
        let mut entries = Vec::new();
        let mut names = HashSet::new();
        let mut position = 0u64;

        loop {
            let header_end = position + LEGACY_HEADER_SIZE as u64;
            if header_end > storage_len {
                return Err(PakError::truncated("legacy entry header", header_end, storage_len));
            }
            let mut header = [0u8; LEGACY_HEADER_SIZE];
            storage.read_exact_at(position, &mut header)?;

            let name_len = header[..NAME_FIELD_SIZE]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| {
                    PakError::MalformedIndex(format!(
                        "unterminated name in header at {:#x}",
                        position
                    ))
                })?;
            if name_len == 0 {
                break;
            }
            let name = decode_name(&header[..name_len], position)?;

            let header_size = le_u32(&header[0x40..0x44]);
            let size = le_u32(&header[0x44..0x48]) as u64;
            let next = le_u32(&header[0x48..0x4C]) as u64;
            let unk = le_u32(&header[0x4C..0x50]);

            if header_size as usize != LEGACY_HEADER_SIZE {
                warn!(name = %name, header_size, "odd legacy header size");
            }
            if unk != LEGACY_HEADER_CONST {
                warn!(name = %name, value = %format!("{:#x}", unk), "odd legacy header constant");
            }

            let data_end = header_end + size;
            if data_end > storage_len {
                return Err(PakError::truncated(format!("data of {}", name), data_end, storage_len));
            }
            if next < LEGACY_HEADER_SIZE as u64 + size {
                return Err(PakError::MalformedIndex(format!(
                    "next header offset {:#x} of {} falls inside its data",
                    next, name
                )));
            }
            if !names.insert(name.clone()) {
                return Err(PakError::MalformedIndex(format!("duplicate name: {}", name)));
            }

            entries.push(LegacyEntry {
                name,
                offset: header_end,
                size,
            });
            position += next;
        }

        info!(entries = entries.len(), "legacy pak opened");
        Ok(Self { storage, entries })
    }

    pub fn entries(&self) -> std::slice::Iter<'_, LegacyEntry> {
        self.entries.iter()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, name: &str) -> Option<&LegacyEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        let entry = self
            .entry(name)
            .ok_or_else(|| PakError::NotFound(name.to_string()))?;
        let mut data = vec![0u8; entry.size as usize];
        self.storage.read_exact_at(entry.offset, &mut data)?;
        Ok(data)
    }

    /// Copy one file's data into `writer`
    pub fn copy_entry_to<W: Write>(&self, entry: &LegacyEntry, mut writer: W) -> Result<u64> {
        let mut data = RangeReader::new(&self.storage, entry.offset, entry.size);
        Ok(io::copy(&mut data, &mut writer)?)
    }
}

/// Sequential writer for legacy paks
///
/// Once a write to the destination fails the chain is broken, and every
/// later call reports `InvalidState`.
pub struct LegacyWriter<W: Write> {
    dest: W,
    names: HashSet<String>,
    failed: bool,
}

impl<W: Write> LegacyWriter<W> {
    pub fn new(dest: W) -> Self {
        Self {
            dest,
            names: HashSet::new(),
            failed: false,
        }
    }

    pub fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.add_entry_from_reader(name, data, data.len() as u64)
    }

    /// Append a file whose length is known up front
    pub fn add_entry_from_reader<R: Read>(&mut self, name: &str, reader: R, size: u64) -> Result<()> {
        self.ensure_writable()?;
        let encoded = encode_name(name)?;
        if self.names.contains(name) {
            return Err(PakError::DuplicatePath(name.to_string()));
        }

        let padding = (ALIGNMENT - size % ALIGNMENT) % ALIGNMENT;
        let next = LEGACY_HEADER_SIZE as u64 + size + padding;
        let (size32, next32) = match (u32::try_from(size), u32::try_from(next)) {
            (Ok(s), Ok(n)) if n != TERMINATOR => (s, n),
            _ => {
                return Err(PakError::EntryTooLarge {
                    path: name.to_string(),
                    size,
                })
            }
        };

        if let Err(e) = self.write_entry(&encoded, reader, size32, next32, padding) {
            self.failed = true;
            return Err(e.for_entry(name));
        }

        debug!(name, size, "added legacy entry");
        self.names.insert(name.to_string());
        Ok(())
    }

    /// Write the terminator header and return the destination
    pub fn finish(mut self) -> Result<W> {
        self.ensure_writable()?;
        self.write_header(&[], TERMINATOR, TERMINATOR)?;
        self.dest.flush()?;
        info!(entries = self.names.len(), "legacy pak written");
        Ok(self.dest)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.failed {
            return Err(PakError::InvalidState("legacy pak write failed earlier"));
        }
        Ok(())
    }

    fn write_entry<R: Read>(
        &mut self,
        name: &[u8],
        reader: R,
        size: u32,
        next: u32,
        padding: u64,
    ) -> Result<()> {
        self.write_header(name, size, next)?;
        let size = u64::from(size);
        let copied = io::copy(&mut reader.take(size), &mut self.dest)?;
        if copied != size {
            return Err(PakError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source ended after {} of {} bytes", copied, size),
            )));
        }
        self.dest.write_all(&[0u8; ALIGNMENT as usize][..padding as usize])?;
        Ok(())
    }

    fn write_header(&mut self, name: &[u8], size: u32, next: u32) -> Result<()> {
        let mut header = [0u8; LEGACY_HEADER_SIZE];
        header[..name.len()].copy_from_slice(name);
        header[0x40..0x44].copy_from_slice(&(LEGACY_HEADER_SIZE as u32).to_le_bytes());
        header[0x44..0x48].copy_from_slice(&size.to_le_bytes());
        header[0x48..0x4C].copy_from_slice(&next.to_le_bytes());
        header[0x4C..0x50].copy_from_slice(&LEGACY_HEADER_CONST.to_le_bytes());
        self.dest.write_all(&header)?;
        Ok(())
    }
}

/// Write a complete legacy pak from in-memory files
pub fn write_legacy<W, I, N, D>(dest: W, entries: I) -> Result<W>
where
    W: Write,
    I: IntoIterator<Item = (N, D)>,
    N: AsRef<str>,
    D: AsRef<[u8]>,
{
    let mut writer = LegacyWriter::new(dest);
    for (name, data) in entries {
        writer.add_entry(name.as_ref(), data.as_ref())?;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        write_legacy(
            Vec::new(),
            [("first.bin", &b"0123456789"[..]), ("SECOND.DAT", &[0xAAu8; 32][..])],
        )
        .unwrap()
    }

    #[test]
    fn test_layout_matches_chain() {
        let bytes = sample();
        // 0x50 + 10 data + 6 pad, 0x50 + 32 data, 0x50 terminator
        assert_eq!(bytes.len(), 0x50 + 16 + 0x50 + 32 + 0x50);
        assert_eq!(&bytes[..9], b"first.bin");
        assert_eq!(bytes[9], 0);
        assert_eq!(le_u32(&bytes[0x40..]), 0x50);
        assert_eq!(le_u32(&bytes[0x44..]), 10);
        assert_eq!(le_u32(&bytes[0x48..]), 0x60);
        assert_eq!(le_u32(&bytes[0x4C..]), LEGACY_HEADER_CONST);

        let terminator = &bytes[bytes.len() - 0x50..];
        assert_eq!(terminator[0], 0);
        assert_eq!(le_u32(&terminator[0x44..]), TERMINATOR);
        assert_eq!(le_u32(&terminator[0x48..]), TERMINATOR);
    }

    #[test]
    fn test_read_back() {
        let pak = LegacyPak::open(sample()).unwrap();
        let names: Vec<_> = pak.entries().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["first.bin", "SECOND.DAT"]);
        assert_eq!(pak.read_entry("first.bin").unwrap(), b"0123456789");
        assert_eq!(pak.read_entry("SECOND.DAT").unwrap(), vec![0xAA; 32]);
        assert!(matches!(pak.read_entry("missing"), Err(PakError::NotFound(_))));

        let mut out = Vec::new();
        let entry = pak.entry("first.bin").unwrap().clone();
        assert_eq!(pak.copy_entry_to(&entry, &mut out).unwrap(), 10);
        assert_eq!(out, b"0123456789");
    }

    #[test]
    fn test_empty_pak_is_terminator_only() {
        let bytes = write_legacy(Vec::new(), Vec::<(&str, &[u8])>::new()).unwrap();
        assert_eq!(bytes.len(), LEGACY_HEADER_SIZE);
        assert_eq!(LegacyPak::open(bytes).unwrap().entry_count(), 0);
    }

    #[test]
    fn test_missing_terminator_truncated() {
        let mut bytes = sample();
        bytes.truncate(bytes.len() - LEGACY_HEADER_SIZE);
        assert!(matches!(
            LegacyPak::open(bytes),
            Err(PakError::TruncatedFile { .. })
        ));
    }

    #[test]
    fn test_oversized_file_truncated() {
        let mut bytes = sample();
        bytes[0x44..0x48].copy_from_slice(&0x10000u32.to_le_bytes());
        assert!(matches!(
            LegacyPak::open(bytes),
            Err(PakError::TruncatedFile { .. })
        ));
    }

    #[test]
    fn test_next_offset_inside_data_rejected() {
        let mut bytes = sample();
        bytes[0x48..0x4C].copy_from_slice(&0x20u32.to_le_bytes());
        assert!(matches!(
            LegacyPak::open(bytes),
            Err(PakError::MalformedIndex(_))
        ));
    }

    #[test]
    fn test_odd_constant_tolerated() {
        let mut bytes = sample();
        bytes[0x4C..0x50].copy_from_slice(&0u32.to_le_bytes());
        let pak = LegacyPak::open(bytes).unwrap();
        assert_eq!(pak.entry_count(), 2);
    }

    #[test]
    fn test_name_rules() {
        assert!(validate_legacy_name("EVENT.BIN").is_ok());
        assert!(validate_legacy_name("dir/file").is_err());
        assert!(validate_legacy_name("").is_err());
        assert!(validate_legacy_name("..").is_err());
        assert!(validate_legacy_name("tab\tname").is_err());
        assert!(validate_legacy_name("caf\u{e9}").is_err());
        assert!(validate_legacy_name("\u{1F600}.BIN").is_err());
        assert!(validate_legacy_name(&"x".repeat(64)).is_err());
        assert!(validate_legacy_name(&"x".repeat(63)).is_ok());
        // Two bytes per kana: 31 fit, 32 do not
        assert!(validate_legacy_name(&"\u{3042}".repeat(31)).is_ok());
        assert!(validate_legacy_name(&"\u{3042}".repeat(32)).is_err());

        let mut writer = LegacyWriter::new(Vec::new());
        writer.add_entry("a", b"1").unwrap();
        assert!(matches!(
            writer.add_entry("a", b"2"),
            Err(PakError::DuplicatePath(_))
        ));
    }

    #[test]
    fn test_shift_jis_names_round_trip() {
        let name = "\u{3042}\u{30BD}.BIN";
        let bytes = write_legacy(Vec::new(), [(name, &b"kana"[..])]).unwrap();
        // U+3042 is 82 A0, U+30BD is 83 5C
        assert_eq!(&bytes[..9], &[0x82, 0xA0, 0x83, 0x5C, b'.', b'B', b'I', b'N', 0]);

        let pak = LegacyPak::open(bytes).unwrap();
        assert_eq!(pak.entries().next().unwrap().name, name);
        assert_eq!(pak.read_entry(name).unwrap(), b"kana");
    }

    #[test]
    fn test_undecodable_name_rejected() {
        let mut bytes = sample();
        // Lead byte with no trail byte
        bytes[0] = 0x82;
        bytes[1] = 0;
        assert!(matches!(
            LegacyPak::open(bytes),
            Err(PakError::MalformedIndex(_))
        ));
    }

    #[test]
    fn test_too_large_is_validation_error() {
        let mut writer = LegacyWriter::new(Vec::new());
        let err = writer
            .add_entry_from_reader("BIG.BIN", io::empty(), u32::MAX as u64 + 1)
            .unwrap_err();
        assert!(matches!(err, PakError::EntryTooLarge { ref path, .. } if path == "BIG.BIN"));
        assert_eq!(err.class(), crate::error::ErrorClass::Validation);

        // Nothing was written, so the writer is still usable
        writer.add_entry("SMALL.BIN", b"ok").unwrap();
        let pak = LegacyPak::open(writer.finish().unwrap()).unwrap();
        assert_eq!(pak.entry_count(), 1);
    }

    /// Accepts `budget` bytes, then fails every write
    struct FailingDest {
        written: Vec<u8>,
        budget: usize,
    }

    impl Write for FailingDest {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written.len() + buf.len() > self.budget {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writer_refuses_work_after_failed_write() {
        let dest = FailingDest {
            written: Vec::new(),
            budget: LEGACY_HEADER_SIZE + 16,
        };
        let mut writer = LegacyWriter::new(dest);
        writer.add_entry("ONE.BIN", b"first").unwrap();

        let err = writer.add_entry("TWO.BIN", b"second").unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Io);
        assert!(err.to_string().starts_with("TWO.BIN: "));

        assert!(matches!(
            writer.add_entry("THREE.BIN", b""),
            Err(PakError::InvalidState(_))
        ));
        assert!(matches!(writer.finish(), Err(PakError::InvalidState(_))));
    }
}
