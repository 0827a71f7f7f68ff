//! Whole-archive operations over a working directory
//!
//! A session either extracts every entry of an opened archive into a
//! destination directory or rebuilds an archive from a source tree. Failures
//! of single entries are collected into a [`BatchReport`] unless the session
//! is strict, in which case the first failure aborts the operation. Rebuilds
//! write to a temporary sibling of the destination and only replace it once
//! the archive is complete.

use crate::archive::path::logical_path_from;
use crate::archive::{
    ArchiveReader, ArchiveWriter, CompressionMethod, ReadAt, HEADER_SIZE, MAGIC_NUMBER,
};
use crate::cancel::CancelToken;
use crate::config::{OverwritePolicy, PakConfig, PakFormat, SessionOptions};
use crate::error::{PakError, Result};
use crate::legacy::{LegacyPak, LegacyWriter, LEGACY_HEADER_CONST, LEGACY_HEADER_SIZE};
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One entry that could not be processed
#[derive(Debug)]
pub struct EntryFailure {
    pub path: String,
    pub error: PakError,
}

/// Aggregate outcome of a session
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<EntryFailure>,
}

impl BatchReport {
    /// True when no entry failed
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    fn count(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Done => self.succeeded += 1,
            Disposition::Skipped => self.skipped += 1,
        }
    }

    fn fail(&mut self, path: String, error: PakError) {
        warn!(path = %path, error = %error, "entry failed");
        self.failed += 1;
        self.failures.push(EntryFailure { path, error });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Done,
    Skipped,
}

/// Listing row shared by both formats
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub path: String,
    pub size: u64,
    pub stored_size: u64,
    /// `None` for legacy paks, which have no compression
    pub compression: Option<CompressionMethod>,
}

/// Identify the layout of an archive from its leading bytes
pub fn detect_format<S: ReadAt + ?Sized>(storage: &S) -> Result<PakFormat> {
    let len = storage.len()?;
    if len >= HEADER_SIZE as u64 {
        let mut magic = [0u8; 8];
        storage.read_exact_at(0, &mut magic)?;
        if magic == MAGIC_NUMBER {
            return Ok(PakFormat::Container);
        }
    }

    if len >= LEGACY_HEADER_SIZE as u64 {
        let mut header = [0u8; LEGACY_HEADER_SIZE];
        storage.read_exact_at(0, &mut header)?;
        let terminated = header[..0x40].contains(&0);
        let header_size = u32::from_le_bytes([header[0x40], header[0x41], header[0x42], header[0x43]]);
        let constant = u32::from_le_bytes([header[0x4C], header[0x4D], header[0x4E], header[0x4F]]);
        if terminated && (header_size as usize == LEGACY_HEADER_SIZE || constant == LEGACY_HEADER_CONST) {
            return Ok(PakFormat::Legacy);
        }
    }

    Err(PakError::UnknownFormat)
}

fn detect_file_format(path: &Path) -> Result<PakFormat> {
    let file = File::open(path)?;
    detect_format(&file)
}

/// List the entries of an archive file of either format
pub fn list<P: AsRef<Path>>(path: P) -> Result<Vec<ListedEntry>> {
    let path = path.as_ref();
    match detect_file_format(path)? {
        PakFormat::Container => {
            let reader = ArchiveReader::open_path(path)?;
            Ok(reader
                .entries()
                .map(|e| ListedEntry {
                    path: e.path.clone(),
                    size: e.uncompressed_len,
                    stored_size: e.stored_len,
                    compression: Some(e.compression),
                })
                .collect())
        }
        PakFormat::Legacy => {
            let pak = LegacyPak::open_path(path)?;
            Ok(pak
                .entries()
                .map(|e| ListedEntry {
                    path: e.name.clone(),
                    size: e.size,
                    stored_size: e.size,
                    compression: None,
                })
                .collect())
        }
    }
}

/// Extract an archive file of either format into `destination`
pub fn extract<P: AsRef<Path>, Q: AsRef<Path>>(
    archive: P,
    destination: Q,
    options: &SessionOptions,
) -> Result<BatchReport> {
    let archive = archive.as_ref();
    match detect_file_format(archive)? {
        PakFormat::Container => {
            let reader = ArchiveReader::open_path(archive)?;
            extract_all(&reader, destination.as_ref(), options)
        }
        PakFormat::Legacy => {
            let pak = LegacyPak::open_path(archive)?;
            extract_legacy(&pak, destination.as_ref(), options, &CancelToken::new())
        }
    }
}

/// Build an archive at `destination` from the files under `source`
pub fn build<P: AsRef<Path>, Q: AsRef<Path>>(
    source: P,
    destination: Q,
    config: &PakConfig,
) -> Result<BatchReport> {
    rebuild_from(source.as_ref(), destination.as_ref(), config)
}

/// Extract every entry of an opened container
pub fn extract_all<S: ReadAt + Sync>(
    reader: &ArchiveReader<S>,
    destination: &Path,
    options: &SessionOptions,
) -> Result<BatchReport> {
    extract_all_with_cancel(reader, destination, options, &CancelToken::new())
}

pub fn extract_all_with_cancel<S: ReadAt + Sync>(
    reader: &ArchiveReader<S>,
    destination: &Path,
    options: &SessionOptions,
    cancel: &CancelToken,
) -> Result<BatchReport> {
    fs::create_dir_all(destination)?;
    info!(
        entries = reader.entry_count(),
        destination = %destination.display(),
        "extracting archive"
    );

    let entries: Vec<_> = reader.entries().collect();
    let report = run_batch(
        &entries,
        options,
        cancel,
        |entry| entry.path.clone(),
        |entry| {
            let target = safe_destination(destination, &entry.path)?;
            write_out(&target, options.overwrite, |out| {
                reader
                    .stream_descriptor(entry, Some(cancel.clone()))?
                    .copy_to(out)
            })
        },
    )?;

    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        "extraction finished"
    );
    Ok(report)
}

/// Extract every file of an opened legacy pak
pub fn extract_legacy<S: ReadAt + Sync>(
    pak: &LegacyPak<S>,
    destination: &Path,
    options: &SessionOptions,
    cancel: &CancelToken,
) -> Result<BatchReport> {
    fs::create_dir_all(destination)?;
    let entries: Vec<_> = pak.entries().collect();
    let report = run_batch(
        &entries,
        options,
        cancel,
        |entry| entry.name.clone(),
        |entry| {
            let target = safe_destination(destination, &entry.name)?;
            write_out(&target, options.overwrite, |out| pak.copy_entry_to(entry, out))
        },
    )?;
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        "legacy extraction finished"
    );
    Ok(report)
}

/// Rebuild an archive from a source tree
///
/// The archive is written next to `destination` and moved into place only
/// after it has been finalized, so a failed or cancelled rebuild leaves any
/// existing file at `destination` untouched.
pub fn rebuild_from(source: &Path, destination: &Path, config: &PakConfig) -> Result<BatchReport> {
    rebuild_from_with_cancel(source, destination, config, &CancelToken::new())
}

pub fn rebuild_from_with_cancel(
    source: &Path,
    destination: &Path,
    config: &PakConfig,
    cancel: &CancelToken,
) -> Result<BatchReport> {
    let options = &config.session;
    let max_depth = match options.format {
        PakFormat::Container => usize::MAX,
        PakFormat::Legacy => 1,
    };
    let (files, mut report) = collect_source_files(source, max_depth, options.strict)?;
    info!(
        files = files.len(),
        source = %source.display(),
        format = ?options.format,
        "rebuilding archive"
    );

    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let staging = NamedTempFile::new_in(&parent)?;

    let (batch, staging) = match options.format {
        PakFormat::Container => {
            let mut writer = ArchiveWriter::begin(BufWriter::new(staging), config.build.clone())?;
            let batch = run_sequential(
                files.iter(),
                options.strict,
                cancel,
                |file| file.logical.clone(),
                |file| {
                    writer
                        .add_entry_from_disk(&file.logical, &file.disk)
                        .map(|_| Disposition::Done)
                },
            )?;
            writer.finalize()?;
            let staging = writer.into_inner()?.into_inner().map_err(|e| e.into_error())?;
            (batch, staging)
        }
        PakFormat::Legacy => {
            let mut writer = LegacyWriter::new(BufWriter::new(staging));
            let batch = run_sequential(
                files.iter(),
                options.strict,
                cancel,
                |file| file.logical.clone(),
                |file| {
                    // Read whole so a failing source never leaves a half entry
                    let data = fs::read(&file.disk)?;
                    writer.add_entry(&file.logical, &data).map(|_| Disposition::Done)
                },
            )?;
            let staging = writer.finish()?.into_inner().map_err(|e| e.into_error())?;
            (batch, staging)
        }
    };

    staging.as_file().sync_all()?;
    staging.persist(destination).map_err(|e| PakError::Io(e.error))?;

    report.succeeded += batch.succeeded;
    report.skipped += batch.skipped;
    report.failed += batch.failed;
    report.failures.extend(batch.failures);
    info!(
        destination = %destination.display(),
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        "archive rebuilt"
    );
    Ok(report)
}

struct SourceFile {
    logical: String,
    disk: PathBuf,
}

/// Regular files under `root` sorted by logical path, plus a report holding
/// skipped non-regular files and unreadable directory entries
fn collect_source_files(
    root: &Path,
    max_depth: usize,
    strict: bool,
) -> Result<(Vec<SourceFile>, BatchReport)> {
    if !fs::metadata(root)?.is_dir() {
        return Err(PakError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", root.display()),
        )));
    }

    let mut files = Vec::new();
    let mut report = BatchReport::default();
    for item in WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
    {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                let error = PakError::from(e);
                if strict {
                    return Err(error.for_entry(&path));
                }
                report.fail(path, error);
                continue;
            }
        };

        let file_type = item.file_type();
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            debug!(path = %item.path().display(), "skipping non-regular file");
            report.skipped += 1;
            continue;
        }

        let relative = item.path().strip_prefix(root).unwrap_or(item.path());
        match logical_path_from(relative) {
            Ok(logical) => files.push(SourceFile {
                logical,
                disk: item.into_path(),
            }),
            Err(e) if strict => return Err(e),
            Err(e) => report.fail(relative.display().to_string(), e),
        }
    }

    files.sort_by(|a, b| a.logical.cmp(&b.logical));
    Ok((files, report))
}

/// Map a logical path to a location inside `base`, refusing anything that
/// would land outside it
fn safe_destination(base: &Path, logical: &str) -> Result<PathBuf> {
    let mut resolved = base.to_path_buf();
    for segment in logical.split('/') {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => resolved.push(part),
            _ => {
                return Err(PakError::InvalidPath {
                    path: logical.to_string(),
                    reason: "entry would be written outside the destination",
                })
            }
        }
    }
    Ok(resolved)
}

/// Create `target` and fill it, honoring the overwrite policy
///
/// A partially written file is removed when `fill` fails.
fn write_out<F>(target: &Path, policy: OverwritePolicy, fill: F) -> Result<Disposition>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<u64>,
{
    if target.exists() {
        match policy {
            OverwritePolicy::Overwrite => {}
            OverwritePolicy::Skip => {
                debug!(path = %target.display(), "destination exists, skipping");
                return Ok(Disposition::Skipped);
            }
            OverwritePolicy::Fail => {
                return Err(PakError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists", target.display()),
                )));
            }
        }
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut out = BufWriter::new(File::create(target)?);
    let result = fill(&mut out).and_then(|_| out.flush().map_err(PakError::from));
    if let Err(e) = result {
        drop(out);
        let _ = fs::remove_file(target);
        return Err(e);
    }
    Ok(Disposition::Done)
}

/// Run `work` over `items`, on the rayon pool when the session is parallel
fn run_batch<T, N, F>(
    items: &[T],
    options: &SessionOptions,
    cancel: &CancelToken,
    name: N,
    work: F,
) -> Result<BatchReport>
where
    T: Sync,
    N: Fn(&T) -> String + Sync,
    F: Fn(&T) -> Result<Disposition> + Sync,
{
    if !options.parallel {
        return run_sequential(
            items.iter(),
            options.strict,
            cancel,
            |item| name(*item),
            |item| work(*item),
        );
    }

    let abort = AtomicBool::new(false);
    let results: Vec<(String, Result<Disposition>)> = items
        .par_iter()
        .map(|item| {
            let path = name(item);
            if cancel.is_cancelled() || abort.load(Ordering::Relaxed) {
                return (path, Err(PakError::Cancelled));
            }
            let result = work(item);
            if options.strict && result.is_err() {
                abort.store(true, Ordering::Relaxed);
            }
            (path, result)
        })
        .collect();

    cancel.check()?;
    let mut report = BatchReport::default();
    for (path, result) in results {
        match result {
            Ok(disposition) => report.count(disposition),
            // Entries abandoned after a strict failure
            Err(PakError::Cancelled) if options.strict => {}
            Err(e) if options.strict => return Err(e.for_entry(&path)),
            Err(e) => report.fail(path, e),
        }
    }
    Ok(report)
}

fn run_sequential<I, N, F>(
    items: I,
    strict: bool,
    cancel: &CancelToken,
    name: N,
    mut work: F,
) -> Result<BatchReport>
where
    I: IntoIterator,
    N: Fn(&I::Item) -> String,
    F: FnMut(&I::Item) -> Result<Disposition>,
{
    let mut report = BatchReport::default();
    for item in items {
        cancel.check()?;
        let path = name(&item);
        match work(&item) {
            Ok(disposition) => report.count(disposition),
            Err(PakError::Cancelled) => return Err(PakError::Cancelled),
            Err(e) if strict => return Err(e.for_entry(&path)),
            Err(e) => report.fail(path, e),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_destination() {
        let base = Path::new("out");
        assert_eq!(
            safe_destination(base, "a/b.txt").unwrap(),
            Path::new("out").join("a").join("b.txt")
        );
        assert!(safe_destination(base, "../escape").is_err());
        assert!(safe_destination(base, "a/./b").is_err());
        assert!(safe_destination(base, "/abs").is_err());
    }

    #[test]
    fn test_detect_format() {
        let legacy = crate::legacy::write_legacy(Vec::new(), [("A.BIN", &b"x"[..])]).unwrap();
        assert_eq!(detect_format(&legacy).unwrap(), PakFormat::Legacy);

        let mut container = vec![0u8; HEADER_SIZE];
        container[..8].copy_from_slice(&MAGIC_NUMBER);
        assert_eq!(detect_format(&container).unwrap(), PakFormat::Container);

        assert!(matches!(
            detect_format(&vec![0xFFu8; 200]),
            Err(PakError::UnknownFormat)
        ));
        assert!(matches!(detect_format(&Vec::new()), Err(PakError::UnknownFormat)));
    }

    #[test]
    fn test_sequential_strict_stops_at_first_failure() {
        let items = vec![1, 2, 3];
        let mut seen = Vec::new();
        let result = run_sequential(
            items.iter(),
            true,
            &CancelToken::new(),
            |n| n.to_string(),
            |n| {
                seen.push(**n);
                if **n == 2 {
                    Err(PakError::corrupt("", "bad"))
                } else {
                    Ok(Disposition::Done)
                }
            },
        );
        assert!(matches!(result, Err(PakError::EntryFailed { ref path, .. }) if path == "2"));
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_parallel_batch_collects_failures() {
        let items: Vec<u32> = (0..50).collect();
        let options = SessionOptions::default();
        let report = run_batch(
            &items,
            &options,
            &CancelToken::new(),
            |n| n.to_string(),
            |n| match n % 10 {
                0 => Err(PakError::corrupt("", "bad")),
                5 => Ok(Disposition::Skipped),
                _ => Ok(Disposition::Done),
            },
        )
        .unwrap();
        assert_eq!(report.failed, 5);
        assert_eq!(report.skipped, 5);
        assert_eq!(report.succeeded, 40);
        assert_eq!(report.total(), 50);
    }
}
