use crate::archive::codec::{self, Hasher};
use crate::archive::format::{ArchiveHeader, CompressionMethod, HEADER_SIZE};
use crate::archive::index::{ContainerIndex, EntryDescriptor, ReplacePolicy};
use crate::archive::path::validate_path;
use crate::archive::reader::STREAM_CHUNK_SIZE;
use crate::archive::storage::RangeReader;
use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::error::{PakError, Result};
use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Largest file [`ArchiveWriter::add_entry_from_disk`] reads into memory
pub const IN_MEMORY_LIMIT: u64 = 16 * 1024 * 1024;

/// Lifecycle of an [`ArchiveWriter`]; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// Created, nothing added yet; configuration may still change
    Configuring,
    Accumulating,
    Committing,
    Committed,
    /// An I/O failure left the build unusable
    Failed,
}

/// Summary of a finalized container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub entry_count: usize,
    pub archive_len: u64,
    pub index_offset: u64,
    pub index_length: u64,
}

/// Archive writer for creating containers
///
/// Entries are compressed as they are added and staged in an anonymous
/// temporary spool. The destination is only written by [`finalize`], which
/// lays out the header placeholder, the live payloads in index order, the
/// index, and finally the real header.
///
/// [`finalize`]: ArchiveWriter::finalize
pub struct ArchiveWriter<W: Write + Seek = BufWriter<File>> {
    dest: W,
    spool: BufWriter<File>,
    spool_len: u64,
    index: ContainerIndex,
    config: BuildConfig,
    state: BuildState,
}

impl ArchiveWriter<BufWriter<File>> {
    /// Create (or truncate) a container file at `path`
    pub fn create<P: AsRef<Path>>(path: P, config: BuildConfig) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "creating archive");
        Self::begin(BufWriter::new(file), config)
    }
}

impl<W: Write + Seek> ArchiveWriter<W> {
    /// Start a build that will be written to `dest` on finalize
    pub fn begin(dest: W, config: BuildConfig) -> Result<Self> {
        let spool = tempfile::tempfile()?;
        Ok(Self {
            dest,
            spool: BufWriter::new(spool),
            spool_len: 0,
            index: ContainerIndex::new(config.case_sensitive, config.checksum),
            config,
            state: BuildState::Configuring,
        })
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Replace the build configuration; only allowed before the first entry
    pub fn configure(&mut self, config: BuildConfig) -> Result<()> {
        if self.state != BuildState::Configuring {
            return Err(PakError::InvalidState(
                "configuration is fixed once entries are added",
            ));
        }
        self.index = ContainerIndex::new(config.case_sensitive, config.checksum);
        self.config = config;
        Ok(())
    }

    /// Entries staged so far
    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains(path)
    }

    /// Add an entry using the configured compression
    pub fn add_entry(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let method = self.config.method_for(path, data.len() as u64);
        self.stage_bytes(path, data, method, None)
    }

    /// Add an entry with a specific compression method
    pub fn add_entry_with(
        &mut self,
        path: &str,
        data: &[u8],
        method: CompressionMethod,
    ) -> Result<()> {
        self.stage_bytes(path, data, method, None)
    }

    /// Add or overwrite an entry
    ///
    /// The replaced payload stays in the spool but is not written to the
    /// container.
    pub fn replace_entry(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let method = self.config.method_for(path, data.len() as u64);
        let policy = self.replace_policy();
        self.stage_bytes(path, data, method, Some(policy))
    }

    /// Add a file from disk
    ///
    /// Files up to [`IN_MEMORY_LIMIT`] are read whole so they get the same
    /// method selection as [`add_entry`](Self::add_entry); larger ones stream.
    pub fn add_entry_from_disk(&mut self, archive_path: &str, disk_path: &Path) -> Result<()> {
        let mut file = File::open(disk_path)?;
        let len = file.metadata()?.len();
        if len <= IN_MEMORY_LIMIT {
            let mut data = Vec::with_capacity(len as usize);
            file.read_to_end(&mut data)?;
            self.add_entry(archive_path, &data)
        } else {
            self.add_entry_from_reader(archive_path, file)
        }
    }

    /// Add an entry by streaming from `reader`
    pub fn add_entry_from_reader<R: Read>(&mut self, path: &str, reader: R) -> Result<()> {
        self.stage_stream(path, reader, None)
    }

    /// Like [`add_entry_from_reader`](Self::add_entry_from_reader), polling
    /// `cancel` between chunks
    pub fn add_entry_from_reader_with_cancel<R: Read>(
        &mut self,
        path: &str,
        reader: R,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.stage_stream(path, reader, Some(cancel))
    }

    /// Write the container to the destination
    pub fn finalize(&mut self) -> Result<CommitResult> {
        self.ensure_accepting()?;
        self.state = BuildState::Committing;
        match self.commit() {
            Ok(result) => {
                self.state = BuildState::Committed;
                info!(
                    entries = result.entry_count,
                    bytes = result.archive_len,
                    "archive finalized"
                );
                Ok(result)
            }
            Err(e) => {
                self.state = BuildState::Failed;
                warn!(error = %e, "archive finalize failed");
                Err(e)
            }
        }
    }

    /// Give back the destination of a committed build
    pub fn into_inner(self) -> Result<W> {
        if self.state != BuildState::Committed {
            return Err(PakError::InvalidState("archive not finalized"));
        }
        Ok(self.dest)
    }

    fn replace_policy(&self) -> ReplacePolicy {
        if self.config.deterministic_order {
            ReplacePolicy::InPlace
        } else {
            ReplacePolicy::Append
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        match self.state {
            BuildState::Configuring | BuildState::Accumulating => Ok(()),
            BuildState::Failed => Err(PakError::InvalidState("build failed earlier")),
            BuildState::Committing | BuildState::Committed => {
                Err(PakError::InvalidState("archive already finalized"))
            }
        }
    }

    /// Validate a path for a new entry, refusing duplicates unless replacing
    fn admit(&self, path: &str, replacing: bool) -> Result<String> {
        self.ensure_accepting()?;
        let path = validate_path(path)?;
        if !replacing && self.index.contains(&path) {
            return Err(PakError::DuplicatePath(path));
        }
        Ok(path)
    }

    fn stage_bytes(
        &mut self,
        path: &str,
        data: &[u8],
        method: CompressionMethod,
        policy: Option<ReplacePolicy>,
    ) -> Result<()> {
        let path = self.admit(path, policy.is_some())?;
        let digest = codec::digest(data, self.config.checksum);

        // Use compressed only if smaller
        let (stored, method) = match method {
            CompressionMethod::None => (Cow::Borrowed(data), CompressionMethod::None),
            method => {
                let compressed = codec::compress(data, method)?;
                if compressed.len() < data.len() {
                    (Cow::Owned(compressed), method)
                } else {
                    (Cow::Borrowed(data), CompressionMethod::None)
                }
            }
        };

        let offset = self.spool_len;
        if let Err(e) = self.spool.write_all(&stored) {
            self.state = BuildState::Failed;
            return Err(e.into());
        }
        self.spool_len += stored.len() as u64;

        self.record(
            EntryDescriptor {
                path,
                offset,
                stored_len: stored.len() as u64,
                uncompressed_len: data.len() as u64,
                compression: method,
                stored_crc: crc32fast::hash(&stored),
                digest,
            },
            policy,
        );
        Ok(())
    }

    fn stage_stream<R: Read>(
        &mut self,
        path: &str,
        mut reader: R,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let path = self.admit(path, false)?;
        let method = self.config.method_for(&path, u64::MAX);
        let mut hasher = Hasher::new(self.config.checksum);
        let offset = self.spool_len;

        let mut counter = CountingWriter::new(&mut self.spool);
        let staged = stream_into(&mut reader, &mut counter, method, &mut hasher, cancel);
        // Bytes of an abandoned payload stay in the spool as dead space
        self.spool_len += counter.count;
        let stored_len = counter.count;
        let stored_crc = counter.crc.finalize();

        let uncompressed_len = match staged {
            Ok(n) => n,
            Err(StageError::Source(e)) => return Err(e),
            Err(StageError::Spool(e)) => {
                self.state = BuildState::Failed;
                return Err(e);
            }
        };

        self.record(
            EntryDescriptor {
                path,
                offset,
                stored_len,
                uncompressed_len,
                compression: method,
                stored_crc,
                digest: hasher.finalize(),
            },
            None,
        );
        Ok(())
    }

    fn record(&mut self, descriptor: EntryDescriptor, policy: Option<ReplacePolicy>) {
        debug!(
            path = %descriptor.path,
            method = descriptor.compression.name(),
            stored = descriptor.stored_len,
            uncompressed = descriptor.uncompressed_len,
            "staged entry"
        );
        let policy = policy.unwrap_or(ReplacePolicy::Append);
        if let Some(old) = self.index.insert_or_replace(descriptor, policy) {
            debug!(path = %old.path, "replaced staged entry");
        }
        self.state = BuildState::Accumulating;
    }

    fn commit(&mut self) -> Result<CommitResult> {
        if self.config.deterministic_order {
            self.index.sort_by_path();
        }
        self.spool.flush()?;
        let spool = self.spool.get_ref();

        // Zeroed placeholder: an interrupted build has no valid magic
        self.dest.seek(SeekFrom::Start(0))?;
        self.dest.write_all(&[0u8; HEADER_SIZE])?;

        let mut position = HEADER_SIZE as u64;
        for entry in self.index.entries_mut() {
            let mut payload = RangeReader::new(spool, entry.offset, entry.stored_len);
            let copied = io::copy(&mut payload, &mut self.dest)?;
            entry.offset = position;
            position += copied;
        }

        let index_offset = position;
        let index_bytes = self.index.serialize();
        self.dest.write_all(&index_bytes)?;
        let archive_len = index_offset + index_bytes.len() as u64;

        let mut header = ArchiveHeader::new();
        header.set_case_sensitive(self.index.case_sensitive());
        header.checksum = self.index.checksum_algorithm();
        header.entry_count = u32::try_from(self.index.len())
            .map_err(|_| PakError::InvalidState("too many entries for one archive"))?;
        header.index_offset = index_offset;
        header.index_length = index_bytes.len() as u64;
        header.index_crc = crc32fast::hash(&index_bytes);

        self.dest.seek(SeekFrom::Start(0))?;
        header.write_to(&mut self.dest)?;
        self.dest.seek(SeekFrom::Start(archive_len))?;
        self.dest.flush()?;

        Ok(CommitResult {
            entry_count: self.index.len(),
            archive_len,
            index_offset,
            index_length: header.index_length,
        })
    }
}

enum StageError {
    /// Reading the input failed or was cancelled; only this entry is lost
    Source(PakError),
    /// The spool could not be written; the build cannot continue
    Spool(PakError),
}

fn stream_into<R: Read, W: Write>(
    reader: &mut R,
    spool: W,
    method: CompressionMethod,
    hasher: &mut Hasher,
    cancel: Option<&CancelToken>,
) -> std::result::Result<u64, StageError> {
    let mut encoder = codec::encoder(spool, method).map_err(StageError::Spool)?;
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    let mut uncompressed = 0u64;
    loop {
        if let Some(cancel) = cancel {
            cancel.check().map_err(StageError::Source)?;
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StageError::Source(e.into())),
        };
        hasher.update(&buf[..n]);
        encoder
            .write_all(&buf[..n])
            .map_err(|e| StageError::Spool(e.into()))?;
        uncompressed += n as u64;
    }
    encoder.finish().map_err(StageError::Spool)?;
    Ok(uncompressed)
}

/// Counts and checksums the stored bytes of a streamed entry
struct CountingWriter<W> {
    inner: W,
    count: u64,
    crc: crc32fast::Hasher,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            count: 0,
            crc: crc32fast::Hasher::new(),
        }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::reader::ArchiveReader;
    use crate::archive::ChecksumAlgorithm;
    use std::io::Cursor;

    fn writer(config: BuildConfig) -> ArchiveWriter<Cursor<Vec<u8>>> {
        ArchiveWriter::begin(Cursor::new(Vec::new()), config).unwrap()
    }

    fn finish(mut writer: ArchiveWriter<Cursor<Vec<u8>>>) -> Vec<u8> {
        writer.finalize().unwrap();
        writer.into_inner().unwrap().into_inner()
    }

    #[test]
    fn test_layout_header_payload_index() {
        let mut w = writer(BuildConfig::default());
        w.add_entry("a.txt", b"hello").unwrap();
        w.add_entry("dir/b.bin", &[1, 2, 3]).unwrap();
        let result = w.finalize().unwrap();
        let bytes = w.into_inner().unwrap().into_inner();

        assert_eq!(result.entry_count, 2);
        assert_eq!(result.index_offset, HEADER_SIZE as u64 + 8);
        assert_eq!(result.archive_len, bytes.len() as u64);
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + 5], b"hello");

        let reader = ArchiveReader::open(bytes).unwrap();
        assert_eq!(reader.entry("a.txt").unwrap().offset, HEADER_SIZE as u64);
        assert_eq!(reader.entry("dir/b.bin").unwrap().offset, HEADER_SIZE as u64 + 5);
    }

    #[test]
    fn test_empty_archive() {
        let bytes = finish(writer(BuildConfig::default()));
        assert_eq!(bytes.len(), HEADER_SIZE);
        let reader = ArchiveReader::open(bytes).unwrap();
        assert_eq!(reader.entry_count(), 0);
        assert_eq!(reader.entries().count(), 0);
    }

    #[test]
    fn test_incompressible_data_stored_raw() {
        let mut w = writer(BuildConfig::default().with_compression(CompressionMethod::Zstd));
        w.add_entry("tiny", b"ab").unwrap();
        w.add_entry("text", &b"repeat ".repeat(1000)).unwrap();
        let reader = ArchiveReader::open(finish(w)).unwrap();

        assert_eq!(reader.entry("tiny").unwrap().compression, CompressionMethod::None);
        assert_eq!(reader.entry("text").unwrap().compression, CompressionMethod::Zstd);
        assert_eq!(reader.read_entry("text").unwrap(), b"repeat ".repeat(1000));
    }

    #[test]
    fn test_duplicate_and_invalid_paths() {
        let mut w = writer(BuildConfig::default());
        w.add_entry("a.txt", b"1").unwrap();
        assert!(matches!(w.add_entry("a.txt", b"2"), Err(PakError::DuplicatePath(_))));
        assert!(matches!(w.add_entry("../x", b"2"), Err(PakError::InvalidPath { .. })));
        assert!(matches!(w.add_entry("", b"2"), Err(PakError::InvalidPath { .. })));

        // Validation failures leave the build usable
        assert_eq!(w.state(), BuildState::Accumulating);
        w.add_entry("b.txt", b"2").unwrap();
        let reader = ArchiveReader::open(finish(w)).unwrap();
        assert_eq!(reader.read_entry("a.txt").unwrap(), b"1");
    }

    #[test]
    fn test_case_insensitive_duplicates() {
        let mut w = writer(BuildConfig::default().with_case_sensitive(false));
        w.add_entry("Data/File.txt", b"1").unwrap();
        assert!(matches!(
            w.add_entry("data/file.TXT", b"2"),
            Err(PakError::DuplicatePath(_))
        ));
    }

    #[test]
    fn test_replace_entry_policies() {
        let mut w = writer(BuildConfig::default());
        w.add_entry("a", b"old").unwrap();
        w.add_entry("b", b"b").unwrap();
        w.replace_entry("a", b"new").unwrap();
        let reader = ArchiveReader::open(finish(w)).unwrap();
        let order: Vec<_> = reader.entries().map(|e| e.path.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(reader.read_entry("a").unwrap(), b"new");
        // Replaced payload is not carried into the container
        assert_eq!(reader.index().total_stored_len(), 4);

        let mut w = writer(BuildConfig::default().with_deterministic_order(true));
        w.add_entry("b", b"b").unwrap();
        w.add_entry("a", b"old").unwrap();
        w.replace_entry("a", b"new").unwrap();
        let reader = ArchiveReader::open(finish(w)).unwrap();
        let order: Vec<_> = reader.entries().map(|e| e.path.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_streaming_add() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 7) as u8).collect();
        let mut w = writer(
            BuildConfig::default()
                .with_compression(CompressionMethod::Lz4)
                .with_checksum(ChecksumAlgorithm::Sha256),
        );
        w.add_entry_from_reader("stream.bin", Cursor::new(&data)).unwrap();
        let reader = ArchiveReader::open(finish(w)).unwrap();

        let entry = reader.entry("stream.bin").unwrap();
        assert_eq!(entry.compression, CompressionMethod::Lz4);
        assert_eq!(entry.uncompressed_len, data.len() as u64);
        assert!(entry.stored_len < entry.uncompressed_len);
        assert_eq!(reader.read_entry("stream.bin").unwrap(), data);
    }

    #[test]
    fn test_cancelled_stream_drops_only_that_entry() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut w = writer(BuildConfig::default());
        let result = w.add_entry_from_reader_with_cancel("x", Cursor::new(vec![0u8; 10]), &cancel);
        assert!(matches!(result, Err(PakError::Cancelled)));
        assert!(!w.contains("x"));

        w.add_entry("y", b"1").unwrap();
        let reader = ArchiveReader::open(finish(w)).unwrap();
        assert_eq!(reader.entry_count(), 1);
        assert_eq!(reader.read_entry("y").unwrap(), b"1");
    }

    struct FailingReader(usize);

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0 == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "source gone"));
            }
            let n = self.0.min(buf.len());
            buf[..n].fill(b'z');
            self.0 -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_source_error_leaves_dead_spool_bytes() {
        let mut w = writer(BuildConfig::default());
        w.add_entry("before", b"abc").unwrap();
        let result = w.add_entry_from_reader("broken", FailingReader(100));
        assert!(matches!(result, Err(PakError::Io(_))));
        assert_eq!(w.state(), BuildState::Accumulating);
        w.add_entry("after", b"def").unwrap();

        let reader = ArchiveReader::open(finish(w)).unwrap();
        assert_eq!(reader.entry_count(), 2);
        assert_eq!(reader.read_entry("after").unwrap(), b"def");
        assert_eq!(reader.index().total_stored_len(), 6);
    }

    #[test]
    fn test_state_transitions() {
        let mut w = writer(BuildConfig::default());
        assert_eq!(w.state(), BuildState::Configuring);
        w.configure(BuildConfig::default().with_checksum(ChecksumAlgorithm::Sha256))
            .unwrap();
        w.add_entry("a", b"1").unwrap();
        assert_eq!(w.state(), BuildState::Accumulating);
        assert!(matches!(
            w.configure(BuildConfig::default()),
            Err(PakError::InvalidState(_))
        ));

        w.finalize().unwrap();
        assert_eq!(w.state(), BuildState::Committed);
        assert!(matches!(w.add_entry("b", b"2"), Err(PakError::InvalidState(_))));
        assert!(matches!(w.finalize(), Err(PakError::InvalidState(_))));

        let reader = ArchiveReader::open(w.into_inner().unwrap().into_inner()).unwrap();
        assert_eq!(reader.header().checksum, ChecksumAlgorithm::Sha256);
    }

    #[test]
    fn test_into_inner_requires_commit() {
        let w = writer(BuildConfig::default());
        assert!(matches!(w.into_inner(), Err(PakError::InvalidState(_))));
    }
}
