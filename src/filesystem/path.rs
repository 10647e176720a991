//! Safe path handling with traversal prevention.
//!
//! Machine specs carry absolute host paths (kernel image, rootfs) and guest
//! file operations carry absolute guest paths. Both pass through the same
//! sanitizer before anything touches them: relative paths, parent-directory
//! escapes, NUL bytes and percent-encoded variants of the above are all
//! rejected, and `.` segments are normalized away.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("Path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("Path traversal attempt: {0}")]
    Traversal(String),

    #[error("Path contains a NUL byte: {0}")]
    NulByte(String),

    #[error("Path is empty")]
    Empty,
}

/// Validate and normalize an absolute path.
///
/// Returns the path with `.` segments removed. Any `..` component, backslash
/// traversal, raw or percent-encoded NUL, or percent-encoded dot-dot
/// (including the double-encoded form) fails validation.
pub fn sanitize_path(input: &str) -> Result<PathBuf, PathError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }

    if trimmed.contains('\0') {
        return Err(PathError::NulByte(input.to_string()));
    }

    // Percent-encoded escapes, checked case-insensitively. `%252e%252e` does
    // not contain `%2e%2e` as a substring, so both spellings are checked.
    let lowered = trimmed.to_ascii_lowercase();
    if lowered.contains("%00") {
        return Err(PathError::NulByte(input.to_string()));
    }
    if lowered.contains("%2e%2e") || lowered.contains("%252e%252e") {
        return Err(PathError::Traversal(input.to_string()));
    }

    // Backslash separators are not path structure on Linux; a `..\` in the
    // middle of a path is a traversal attempt dressed up for a lenient
    // normalizer.
    if trimmed.contains("..\\") || trimmed.contains("\\..") {
        return Err(PathError::Traversal(input.to_string()));
    }

    if !trimmed.starts_with('/') {
        return Err(PathError::NotAbsolute(input.to_string()));
    }

    let mut result = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::RootDir => result.push("/"),
            Component::Normal(c) => {
                // A component like `..\etc` survives Path parsing as Normal;
                // any embedded dot-dot sequence is still a traversal.
                let s = c.to_string_lossy();
                if s == ".." || s.contains("..\\") {
                    return Err(PathError::Traversal(input.to_string()));
                }
                result.push(c);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(PathError::Traversal(input.to_string()));
            }
            Component::Prefix(_) => {
                return Err(PathError::Traversal(input.to_string()));
            }
        }
    }

    Ok(result)
}
