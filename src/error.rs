use std::io;
use thiserror::Error;

/// Result type for pak operations
pub type Result<T> = std::result::Result<T, PakError>;

/// Unified error type for all pak operations
#[derive(Debug, Error)]
pub enum PakError {
    // Format errors
    #[error("Malformed archive index: {0}")]
    MalformedIndex(String),

    #[error("Unsupported archive version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Truncated archive: {what} needs {required} bytes, storage has {actual}")]
    TruncatedFile {
        what: String,
        required: u64,
        actual: u64,
    },

    #[error("Unrecognized archive format")]
    UnknownFormat,

    // Lookup
    #[error("Entry not found in archive: {0}")]
    NotFound(String),

    // Payload errors
    #[error("Unsupported compression method: {0}")]
    UnsupportedMethod(u8),

    #[error("Corrupt payload for {path}: {reason}")]
    CorruptPayload { path: String, reason: String },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    // Validation errors
    #[error("Invalid entry path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Duplicate entry path: {0}")]
    DuplicatePath(String),

    #[error("Entry {path:?} is too large for this format: {size} bytes")]
    EntryTooLarge { path: String, size: u64 },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    // Build/session state
    #[error("Invalid build state: {0}")]
    InvalidState(&'static str),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{path}: {source}")]
    EntryFailed {
        path: String,
        #[source]
        source: Box<PakError>,
    },
}

/// Coarse error classes, used by callers to pick an exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Header/index problems; fatal to the whole open or build
    Format,
    /// A single entry's bytes are bad; recoverable at the session level
    Payload,
    /// Rejected input (paths, state, configuration)
    Validation,
    Io,
    Cancelled,
}

impl ErrorClass {
    /// Process exit status for this class (sysexits.h values)
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorClass::Format | ErrorClass::Payload => 65,
            ErrorClass::Validation => 64,
            ErrorClass::Io => 74,
            ErrorClass::Cancelled => 75,
        }
    }
}

impl PakError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PakError::MalformedIndex(_)
            | PakError::UnsupportedVersion { .. }
            | PakError::TruncatedFile { .. }
            | PakError::UnknownFormat => ErrorClass::Format,
            PakError::NotFound(_)
            | PakError::UnsupportedMethod(_)
            | PakError::CorruptPayload { .. }
            | PakError::ChecksumMismatch { .. } => ErrorClass::Payload,
            PakError::InvalidPath { .. }
            | PakError::DuplicatePath(_)
            | PakError::EntryTooLarge { .. }
            | PakError::InvalidState(_)
            | PakError::Config(_) => ErrorClass::Validation,
            PakError::Io(_) => ErrorClass::Io,
            PakError::Cancelled => ErrorClass::Cancelled,
            PakError::EntryFailed { source, .. } => source.class(),
        }
    }

    pub(crate) fn truncated(what: impl Into<String>, required: u64, actual: u64) -> Self {
        PakError::TruncatedFile {
            what: what.into(),
            required,
            actual,
        }
    }

    pub(crate) fn corrupt(path: &str, reason: impl Into<String>) -> Self {
        PakError::CorruptPayload {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Fill in the entry path of a payload error raised by path-agnostic code
    pub(crate) fn at_path(self, entry: &str) -> Self {
        match self {
            PakError::CorruptPayload { path, reason } if path.is_empty() => {
                PakError::CorruptPayload {
                    path: entry.to_string(),
                    reason,
                }
            }
            other => other,
        }
    }

    pub(crate) fn for_entry(self, path: &str) -> Self {
        match self {
            already @ PakError::EntryFailed { .. } => already,
            other => PakError::EntryFailed {
                path: path.to_string(),
                source: Box::new(other),
            },
        }
    }
}

impl From<toml::de::Error> for PakError {
    fn from(err: toml::de::Error) -> Self {
        PakError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for PakError {
    fn from(err: toml::ser::Error) -> Self {
        PakError::Config(err.to_string())
    }
}

impl From<walkdir::Error> for PakError {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io_err) => PakError::Io(io_err),
            None => PakError::Io(io::Error::new(
                io::ErrorKind::Other,
                "filesystem loop while walking source tree",
            )),
        }
    }
}
