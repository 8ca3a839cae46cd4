//! Directory index
//!
//! Enumerates a transfer root once and records what a folder transfer needs:
//! leaf folders (sent as metadata so empty directories survive), leaf files
//! in a stable depth-first order, and their aggregate size.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::ScanError;
use crate::path::relative_wire_path;

/// A regular file found by the scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafFile {
    pub path: PathBuf,
    /// Size at scan time; the file may change before it is sent
    pub size: u64,
}

/// Result of scanning a directory tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryIndex {
    /// Directories below the root without subdirectories, relative to the root
    pub leaf_folders: Vec<String>,
    /// Directories visited, root included
    pub total_folders: u32,
    /// Regular files, in walk order
    pub leaf_files: Vec<LeafFile>,
    /// Sum of leaf file sizes in bytes
    pub total_size: u64,
}

impl DirectoryIndex {
    /// Walk `root` depth-first with entries sorted by name.
    ///
    /// Symlinks are not followed and are not transferred. Any unreadable
    /// entry aborts the scan.
    pub fn scan(root: &Path) -> Result<Self, ScanError> {
        let meta = fs::metadata(root).map_err(|e| ScanError::from_io(root.to_path_buf(), &e))?;
        if !meta.is_dir() {
            return Err(ScanError::NotADirectory(root.to_path_buf()));
        }

        let mut index = DirectoryIndex::default();
        // (relative path, has subdirectory) for every directory below the root
        let mut folders: Vec<(String, bool)> = Vec::new();
        let mut folder_slots: HashMap<PathBuf, usize> = HashMap::new();

        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| walk_error(root, e))?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                index.total_folders += 1;
                if entry.depth() == 0 {
                    continue;
                }
                if let Some(parent) = entry.path().parent() {
                    if let Some(&slot) = folder_slots.get(parent) {
                        folders[slot].1 = true;
                    }
                }
                let relative = relative_wire_path(entry.path(), root).map_err(|e| ScanError::Io {
                    path: entry.path().to_path_buf(),
                    message: e.to_string(),
                })?;
                folder_slots.insert(entry.path().to_path_buf(), folders.len());
                folders.push((relative, false));
            } else if file_type.is_file() {
                let size = entry.metadata().map_err(|e| walk_error(root, e))?.len();
                index.total_size += size;
                index.leaf_files.push(LeafFile {
                    path: entry.into_path(),
                    size,
                });
            } else {
                debug!(path = %entry.path().display(), "skipping non-regular entry");
            }
        }

        index.leaf_folders = folders
            .into_iter()
            .filter(|(_, has_subdir)| !has_subdir)
            .map(|(path, _)| path)
            .collect();

        debug!(
            root = %root.display(),
            files = index.leaf_files.len(),
            folders = index.total_folders,
            bytes = index.total_size,
            "scanned directory"
        );
        Ok(index)
    }

    /// Leaf folders encoded as a JSON array for the directory header
    pub fn leaf_folders_json(&self) -> String {
        serde_json::to_string(&self.leaf_folders).unwrap_or_else(|_| "[]".into())
    }
}

fn walk_error(root: &Path, e: walkdir::Error) -> ScanError {
    let path = e.path().unwrap_or(root).to_path_buf();
    match e.io_error() {
        Some(io) => ScanError::from_io(path, io),
        None => ScanError::Io {
            path,
            message: e.to_string(),
        },
    }
}
