//! Outbound transfer queue
//!
//! Holds the paths a user asked to send and turns each into a fresh
//! `TransferSession` when its turn comes. Sessions are handed out one at a
//! time; a queue never interleaves two transfers.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::{ScanError, TransferError};
use crate::path::display_name;
use crate::session::{FileSource, LocalFs, SessionOptions, TransferSession};

/// A path waiting to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTransfer {
    pub id: u32,
    pub path: PathBuf,
}

/// FIFO of pending transfers with sequential session ids
pub struct TransferQueue {
    pending: VecDeque<QueuedTransfer>,
    next_id: u32,
    options: SessionOptions,
    files: Arc<dyn FileSource>,
}

impl TransferQueue {
    pub fn new(options: SessionOptions) -> Self {
        Self::with_source(options, Arc::new(LocalFs))
    }

    pub fn with_source(options: SessionOptions, files: Arc<dyn FileSource>) -> Self {
        Self {
            pending: VecDeque::new(),
            next_id: 1,
            options,
            files,
        }
    }

    /// Queue `path` for sending and return its session id.
    ///
    /// The path is canonicalized so the transfer name is never `.` or `..`.
    pub fn push(&mut self, path: impl AsRef<Path>) -> Result<u32, TransferError> {
        let path = path.as_ref();
        let canonical =
            fs::canonicalize(path).map_err(|e| ScanError::from_io(path.to_path_buf(), &e))?;
        display_name(&canonical)?;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        debug!(id, path = %canonical.display(), "queued transfer");
        self.pending.push_back(QueuedTransfer {
            id,
            path: canonical,
        });
        Ok(id)
    }

    /// Build the session for the next queued path.
    ///
    /// A path that vanished since `push` yields an error; the queue moves on.
    pub fn next_session(&mut self) -> Option<Result<TransferSession, TransferError>> {
        let item = self.pending.pop_front()?;
        Some(TransferSession::with_source(
            item.id,
            item.path,
            self.options,
            self.files.clone(),
        ))
    }

    pub fn pending(&self) -> impl Iterator<Item = &QueuedTransfer> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sequential_ids_and_order() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a"), b"a").unwrap();
        fs::create_dir(temp.path().join("b")).unwrap();

        let mut queue = TransferQueue::new(SessionOptions::default());
        assert_eq!(queue.push(temp.path().join("a")).unwrap(), 1);
        assert_eq!(queue.push(temp.path().join("b")).unwrap(), 2);
        assert_eq!(queue.len(), 2);

        let first = queue.next_session().unwrap().unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(first.name(), "a");
        assert!(!first.is_folder());

        let second = queue.next_session().unwrap().unwrap();
        assert_eq!(second.id(), 2);
        assert!(second.is_folder());

        assert!(queue.next_session().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_missing_path_rejected() {
        let temp = TempDir::new().unwrap();
        let mut queue = TransferQueue::new(SessionOptions::default());
        let err = queue.push(temp.path().join("missing")).unwrap_err();
        assert!(matches!(err, TransferError::Scan(ScanError::PathNotFound(_))));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_relative_dot_gets_real_name() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("project");
        fs::create_dir(&dir).unwrap();

        let mut queue = TransferQueue::new(SessionOptions::default());
        queue.push(dir.join(".")).unwrap();
        let session = queue.next_session().unwrap().unwrap();
        assert_eq!(session.name(), "project");
    }

    #[test]
    fn test_vanished_path_errors_at_turn() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("gone");
        fs::write(&file, b"x").unwrap();

        let mut queue = TransferQueue::new(SessionOptions::default());
        queue.push(&file).unwrap();
        fs::remove_file(&file).unwrap();

        assert!(queue.next_session().unwrap().is_err());
        assert!(queue.next_session().is_none());
    }
}
