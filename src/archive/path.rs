use crate::archive::format::MAX_PATH_LENGTH;
use crate::error::{PakError, Result};
use std::path::{Component, Path};

/// Normalize path to forward slashes (cross-platform compatibility)
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Normalize and validate an archive-relative logical path
///
/// Accepted paths are relative, `/`-separated, and made only of ordinary
/// segments: no empty, `.` or `..` segments, no drive prefix, no NUL.
pub fn validate_path(path: &str) -> Result<String> {
    let normalized = normalize_path(path);
    let invalid = |reason: &'static str| PakError::InvalidPath {
        path: path.to_string(),
        reason,
    };

    if normalized.is_empty() {
        return Err(invalid("path is empty"));
    }
    if normalized.len() > MAX_PATH_LENGTH {
        return Err(invalid("path exceeds maximum length"));
    }
    if normalized.contains('\0') {
        return Err(invalid("path contains a NUL byte"));
    }
    if normalized.starts_with('/') {
        return Err(invalid("path is absolute"));
    }
    if has_drive_prefix(&normalized) {
        return Err(invalid("path has a drive prefix"));
    }

    for segment in normalized.split('/') {
        match segment {
            "" => return Err(invalid("path has an empty segment")),
            "." => return Err(invalid("path has a '.' segment")),
            ".." => return Err(invalid("path has a parent-traversal segment")),
            _ => {}
        }
    }

    Ok(normalized)
}

/// Lookup key for a validated path under the archive's case policy
pub fn path_key(path: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        path.to_string()
    } else {
        path.to_lowercase()
    }
}

/// Convert a filesystem path relative to a source root into a logical path
pub fn logical_path_from(relative: &Path) -> Result<String> {
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| PakError::InvalidPath {
                    path: relative.display().to_string(),
                    reason: "path is not valid UTF-8",
                })?;
                segments.push(part);
            }
            Component::CurDir => {}
            _ => {
                return Err(PakError::InvalidPath {
                    path: relative.display().to_string(),
                    reason: "path is not relative to the source tree",
                })
            }
        }
    }
    validate_path(&segments.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
