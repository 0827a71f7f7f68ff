//! Build and session configuration
//!
//! Every option has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! [build]
//! compression = "zstd"        # none | lz4 | zstd
//! adaptive_compression = false
//! case_sensitive = true
//! deterministic_order = true
//! checksum = "crc32"          # crc32 | sha256
//!
//! [session]
//! strict = false
//! parallel = true
//! overwrite = "overwrite"     # overwrite | skip | fail
//! format = "container"        # container | legacy
//! ```

use crate::archive::{ChecksumAlgorithm, CompressionMethod};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Options fixed for the lifetime of one archive build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Method applied to every entry added without an explicit method
    pub compression: CompressionMethod,
    /// Pick a method per entry from its extension and size instead
    pub adaptive_compression: bool,
    /// Whether paths differing only in case are distinct entries
    pub case_sensitive: bool,
    /// Sort entries by path at commit so identical inputs give identical bytes
    pub deterministic_order: bool,
    pub checksum: ChecksumAlgorithm,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::None,
            adaptive_compression: false,
            case_sensitive: true,
            deterministic_order: false,
            checksum: ChecksumAlgorithm::Crc32,
        }
    }
}

impl BuildConfig {
    pub fn with_compression(mut self, method: CompressionMethod) -> Self {
        self.compression = method;
        self
    }

    pub fn with_deterministic_order(mut self, deterministic: bool) -> Self {
        self.deterministic_order = deterministic;
        self
    }

    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn with_checksum(mut self, checksum: ChecksumAlgorithm) -> Self {
        self.checksum = checksum;
        self
    }

    /// Method for one entry under this configuration
    pub fn method_for(&self, path: &str, size: u64) -> CompressionMethod {
        if self.adaptive_compression {
            CompressionMethod::choose_for_file(path, size)
        } else {
            self.compression
        }
    }
}

/// What extraction does when a destination file already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    #[default]
    Overwrite,
    /// Leave the existing file and count the entry as skipped
    Skip,
    /// Record the entry as failed
    Fail,
}

/// On-disk layout used by whole-archive operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PakFormat {
    /// Indexed container: header, payload region, index region
    #[default]
    Container,
    /// Flat chain of 0x50-byte entry headers
    Legacy,
}

/// Options for whole-archive extraction and rebuild
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionOptions {
    /// Abort on the first entry failure instead of skipping and reporting
    pub strict: bool,
    /// Extract entries on the rayon thread pool
    pub parallel: bool,
    pub overwrite: OverwritePolicy,
    /// Layout written by `build`
    pub format: PakFormat,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            strict: false,
            parallel: true,
            overwrite: OverwritePolicy::Overwrite,
            format: PakFormat::Container,
        }
    }
}

impl SessionOptions {
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }
}

/// Complete configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PakConfig {
    pub build: BuildConfig,
    pub session: SessionOptions,
}

impl PakConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}
