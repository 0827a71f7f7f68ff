//! Positional read access to the bytes of a container
//!
//! Readers never move a shared cursor, so one opened archive can serve reads
//! of different entries from several threads at once.

use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;

/// Random-access, read-only byte storage
pub trait ReadAt {
    /// Total length of the storage in bytes
    fn len(&self) -> io::Result<u64>;

    /// Fill `buf` from `offset`, failing with `UnexpectedEof` past the end
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl ReadAt for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    #[cfg(unix)]
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.seek_read(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to fill whole buffer",
                    ))
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl ReadAt for [u8] {
    fn len(&self) -> io::Result<u64> {
        Ok(<[u8]>::len(self) as u64)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset).ok();
        let end = start.and_then(|s| s.checked_add(buf.len()));
        match (start, end) {
            (Some(start), Some(end)) if end <= <[u8]>::len(self) => {
                buf.copy_from_slice(&self[start..end]);
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of buffer",
            )),
        }
    }
}

impl ReadAt for Vec<u8> {
    fn len(&self) -> io::Result<u64> {
        Ok(self.as_slice().len() as u64)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        ReadAt::read_exact_at(self.as_slice(), offset, buf)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn len(&self) -> io::Result<u64> {
        (**self).len()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn len(&self) -> io::Result<u64> {
        (**self).len()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

/// Marker wrapped around storage failures that pass through a decompressor,
/// so they can be told apart from malformed compressed data.
#[derive(Debug)]
pub(crate) struct StorageFault(pub io::Error);

impl std::fmt::Display for StorageFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "storage read failed: {}", self.0)
    }
}

impl std::error::Error for StorageFault {}

/// Extract the original storage error if `err` carries a [`StorageFault`]
pub(crate) fn take_storage_fault(err: io::Error) -> Result<io::Error, io::Error> {
    if err
        .get_ref()
        .map(|inner| inner.is::<StorageFault>())
        .unwrap_or(false)
    {
        match err.into_inner().map(|inner| inner.downcast::<StorageFault>()) {
            Some(Ok(fault)) => Ok(fault.0),
            _ => Err(io::Error::new(io::ErrorKind::Other, "storage fault")),
        }
    } else {
        Err(err)
    }
}

/// `Read` over a fixed byte range of a [`ReadAt`] storage
pub struct RangeReader<'a, S: ReadAt + ?Sized> {
    storage: &'a S,
    position: u64,
    end: u64,
}

impl<'a, S: ReadAt + ?Sized> RangeReader<'a, S> {
    pub fn new(storage: &'a S, offset: u64, len: u64) -> Self {
        Self {
            storage,
            position: offset,
            end: offset.saturating_add(len),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.position
    }
}

impl<S: ReadAt + ?Sized> Read for RangeReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = (buf.len() as u64).min(self.remaining()) as usize;
        if want == 0 {
            return Ok(0);
        }
        self.storage
            .read_exact_at(self.position, &mut buf[..want])
            .map_err(|e| io::Error::new(e.kind(), StorageFault(e)))?;
        self.position += want as u64;
        Ok(want)
    }
}
