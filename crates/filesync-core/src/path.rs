//! Wire path handling
//!
//! Paths cross the wire relative to the transfer root and always use `/`
//! separators. Received paths are validated before they touch the
//! filesystem so a peer cannot write outside the destination directory.

use std::path::{Component, Path, PathBuf};

use crate::error::PathError;
use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};

/// Express `path` relative to `root` using forward slashes.
///
/// `root` itself maps to the empty string.
pub fn relative_wire_path(path: &Path, root: &Path) -> Result<String, PathError> {
    let relative = path.strip_prefix(root).map_err(|_| PathError::NotUnderRoot {
        path: path.to_path_buf(),
        root: root.to_path_buf(),
    })?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => {
                let name = name
                    .to_str()
                    .ok_or_else(|| PathError::NotUtf8(path.to_path_buf()))?;
                parts.push(name);
            }
            Component::CurDir => {}
            _ => {
                return Err(PathError::Traversal(format!(
                    "unexpected component in {}",
                    relative.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Resolve a received relative path safely within `base`.
///
/// Rejects absolute paths, `..`, NUL bytes, and over-long names. Works on
/// paths that do not exist yet. Both `/` and `\` are treated as separators so
/// a peer on another platform cannot smuggle a separator inside a name.
pub fn safe_path(base: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.contains('\0') {
        return Err(PathError::Traversal("path contains null byte".into()));
    }

    if relative.len() > MAX_PATH_LEN {
        return Err(PathError::Traversal(format!(
            "path too long: {} bytes (max {})",
            relative.len(),
            MAX_PATH_LEN
        )));
    }

    if relative.starts_with('/') || relative.starts_with('\\') || Path::new(relative).is_absolute()
    {
        return Err(PathError::Traversal("absolute paths not allowed".into()));
    }

    let mut result = base.to_path_buf();
    for part in relative.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                return Err(PathError::Traversal(
                    "parent directory (..) not allowed".into(),
                ))
            }
            name => {
                validate_filename(name)?;
                // Drive prefixes like `C:` on the sending host
                if name.contains(':') {
                    return Err(PathError::Traversal("path prefixes not allowed".into()));
                }
                result.push(name);
            }
        }
    }

    if !result.starts_with(base) {
        return Err(PathError::Traversal("path escapes base directory".into()));
    }

    Ok(result)
}

/// Validate a single path component
pub fn validate_filename(name: &str) -> Result<(), PathError> {
    if name.is_empty() {
        return Err(PathError::Traversal("empty filename".into()));
    }

    if name.contains('\0') {
        return Err(PathError::Traversal("filename contains null byte".into()));
    }

    if name.len() > MAX_FILENAME_LEN {
        return Err(PathError::Traversal(format!(
            "filename too long: {} bytes (max {})",
            name.len(),
            MAX_FILENAME_LEN
        )));
    }

    if name == "." || name == ".." {
        return Err(PathError::Traversal(
            "special directory names not allowed".into(),
        ));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(PathError::Traversal(
            "filename contains path separator".into(),
        ));
    }

    Ok(())
}

/// Final component of `path` as UTF-8, used as the transfer's display name
pub fn display_name(path: &Path) -> Result<String, PathError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| PathError::NotUtf8(path.to_path_buf()))
}
