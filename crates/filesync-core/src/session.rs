//! Transfer session state machine
//!
//! A `TransferSession` turns one file or directory into an ordered stream
//! of messages, one per `pull_next` call:
//!
//! ```text
//! file:    Initial ──FileHeader──► Block ──blocks──► End ──FileEnd──► Finished
//!
//! folder:  Initial ──DirectoryHeader──► Metadata ──ItemHeader──► Block ─┐
//!                                          ▲                             │
//!                                          └──────── End ◄───blocks──────┘
//!                                                     │ (no items left)
//!                                                     └──FileEnd──► Finished
//! ```
//!
//! Each pull does at most one bounded read or one metadata step, so the
//! caller controls pacing. Items that fail to open or read are skipped.
//! Dropping a session releases its open file and emits nothing further.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::{ItemError, ScanError, TransferError};
use crate::index::{DirectoryIndex, LeafFile};
use crate::message::{ControlMessage, DataBlock, Outbound, BLOCK_HEADER_LEN};
use crate::path::{display_name, relative_wire_path};
use crate::progress::Progress;
use crate::DEFAULT_BLOCK_SIZE;

/// Filesystem collaborator: sequential read handles and sizes
pub trait FileSource: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
    fn size(&self, path: &Path) -> io::Result<u64>;
}

/// `FileSource` over the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl FileSource for LocalFs {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }
}

/// Session tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Wire size of a data block, session id prefix included
    pub block_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl SessionOptions {
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(BLOCK_HEADER_LEN + 1),
        }
    }

    /// Options whose blocks carry exactly `capacity` file bytes
    pub fn with_payload_capacity(capacity: usize) -> Self {
        Self::with_block_size(capacity.max(1) + BLOCK_HEADER_LEN)
    }

    /// File bytes per data block
    pub fn payload_capacity(&self) -> usize {
        self.block_size.saturating_sub(BLOCK_HEADER_LEN).max(1)
    }

    /// Number of blocks needed for `size` bytes
    pub fn block_count(&self, size: u64) -> u64 {
        size.div_ceil(self.payload_capacity() as u64)
    }
}

/// Where a session is in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initial,
    Metadata,
    Block,
    End,
    Finished,
}

/// Result of one `pull_next` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pull {
    /// True when this pull produced a data block
    pub has_more_blocks: bool,
    /// Transfer progress, 0-100
    pub progress: u8,
    pub message: Option<Outbound>,
}

impl Pull {
    fn control(progress: u8, msg: ControlMessage) -> Self {
        Self {
            has_more_blocks: false,
            progress,
            message: Some(Outbound::Control(msg)),
        }
    }

    fn terminal() -> Self {
        Self {
            has_more_blocks: false,
            progress: 100,
            message: None,
        }
    }

    /// The pull signalling that the transfer is over
    pub fn is_terminal(&self) -> bool {
        !self.has_more_blocks && self.message.is_none()
    }
}

struct OpenItem {
    path: PathBuf,
    reader: Box<dyn Read + Send>,
}

/// One outbound file or folder transfer
pub struct TransferSession {
    id: u32,
    source_path: PathBuf,
    name: String,
    is_folder: bool,
    phase: Phase,
    options: SessionOptions,
    files: Arc<dyn FileSource>,
    item: Progress,
    folder: Progress,
    leaf_files: Vec<LeafFile>,
    cursor: usize,
    current: Option<OpenItem>,
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("id", &self.id)
            .field("source_path", &self.source_path)
            .field("is_folder", &self.is_folder)
            .field("phase", &self.phase)
            .field("item", &self.item)
            .field("folder", &self.folder)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl TransferSession {
    /// Create a session reading from the local filesystem
    pub fn new(id: u32, path: impl Into<PathBuf>, options: SessionOptions) -> Result<Self, TransferError> {
        Self::with_source(id, path, options, Arc::new(LocalFs))
    }

    /// Create a session with a custom file source.
    ///
    /// The path must exist; whether it is a folder is decided here, once.
    pub fn with_source(
        id: u32,
        path: impl Into<PathBuf>,
        options: SessionOptions,
        files: Arc<dyn FileSource>,
    ) -> Result<Self, TransferError> {
        let source_path = path.into();
        let meta = fs::metadata(&source_path)
            .map_err(|e| ScanError::from_io(source_path.clone(), &e))?;
        let name = display_name(&source_path)?;

        Ok(Self {
            id,
            source_path,
            name,
            is_folder: meta.is_dir(),
            phase: Phase::Initial,
            options,
            files,
            item: Progress::default(),
            folder: Progress::default(),
            leaf_files: Vec::new(),
            cursor: 0,
            current: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_folder(&self) -> bool {
        self.is_folder
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Current progress against the folder aggregate or the single item
    pub fn progress(&self) -> u8 {
        if self.is_folder {
            self.folder.percent()
        } else {
            self.item.percent()
        }
    }

    /// Produce the next message and advance.
    ///
    /// Errors only when the directory scan fails, which ends the session.
    pub fn pull_next(&mut self) -> Result<Pull, TransferError> {
        match self.phase {
            Phase::Initial if self.is_folder => self.start_folder(),
            Phase::Initial => Ok(self.start_file()),
            Phase::Metadata => Ok(self.next_item_header()),
            Phase::Block => Ok(self.next_block()),
            Phase::End => Ok(self.finish_item()),
            Phase::Finished => Ok(Pull::terminal()),
        }
    }

    fn start_folder(&mut self) -> Result<Pull, TransferError> {
        let index = match DirectoryIndex::scan(&self.source_path) {
            Ok(index) => index,
            Err(e) => {
                error!(id = self.id, error = %e, "directory scan failed, aborting transfer");
                self.phase = Phase::Finished;
                return Err(e.into());
            }
        };

        info!(
            id = self.id,
            path = %self.source_path.display(),
            files = index.leaf_files.len(),
            bytes = index.total_size,
            "starting folder transfer"
        );

        let header = ControlMessage::directory_header(
            self.id,
            &self.name,
            index.total_size,
            index.leaf_folders_json(),
            index.total_folders,
        );
        self.folder = Progress::new(index.total_size);
        self.leaf_files = index.leaf_files;
        self.cursor = 0;
        self.phase = Phase::Metadata;
        Ok(Pull::control(0, header))
    }

    fn start_file(&mut self) -> Pull {
        let path = self.source_path.clone();
        match self.files.open(&path) {
            Ok(reader) => {
                self.current = Some(OpenItem {
                    path: path.clone(),
                    reader,
                })
            }
            Err(e) => {
                let e = ItemError::ItemOpenFailed {
                    path: path.clone(),
                    message: e.to_string(),
                };
                error!(id = self.id, error = %e, "cannot open file, sending header only");
            }
        }

        let size = self.files.size(&path).unwrap_or_else(|e| {
            warn!(id = self.id, error = %e, "cannot stat file, assuming empty");
            0
        });
        self.item = Progress::new(size);

        info!(id = self.id, path = %path.display(), bytes = size, "starting file transfer");

        let header = ControlMessage::file_header(
            self.id,
            &self.name,
            size,
            self.options.block_count(size),
        );
        self.phase = Phase::Block;
        Pull::control(0, header)
    }

    /// Open the next readable leaf file and announce it.
    fn next_item_header(&mut self) -> Pull {
        while self.cursor < self.leaf_files.len() {
            let leaf = self.leaf_files[self.cursor].clone();
            self.cursor += 1;

            match self.open_item(&leaf.path) {
                Ok((item, size, relative)) => {
                    debug!(id = self.id, path = %relative, bytes = size, "next folder item");
                    if size != leaf.size {
                        debug!(id = self.id, path = %relative, scanned = leaf.size, now = size, "item changed since scan");
                        self.folder.total = self
                            .folder
                            .total
                            .saturating_sub(leaf.size)
                            .saturating_add(size);
                    }
                    self.current = Some(item);
                    self.item = Progress::new(size);
                    self.phase = Phase::Block;
                    let header = ControlMessage::directory_item_header(
                        self.id,
                        &relative,
                        size,
                        self.options.block_count(size),
                    );
                    return Pull::control(self.progress(), header);
                }
                Err(e) => {
                    warn!(id = self.id, error = %e, "skipping folder item");
                    // The skipped bytes will never arrive
                    self.folder.total = self.folder.total.saturating_sub(leaf.size);
                }
            }
        }

        self.phase = Phase::End;
        self.finish_item()
    }

    fn open_item(&self, path: &Path) -> Result<(OpenItem, u64, String), ItemError> {
        let open_failed = |message: String| ItemError::ItemOpenFailed {
            path: path.to_path_buf(),
            message,
        };

        let relative =
            relative_wire_path(path, &self.source_path).map_err(|e| open_failed(e.to_string()))?;
        let reader = self.files.open(path).map_err(|e| open_failed(e.to_string()))?;
        let size = self.files.size(path).map_err(|e| open_failed(e.to_string()))?;

        Ok((
            OpenItem {
                path: path.to_path_buf(),
                reader,
            },
            size,
            relative,
        ))
    }

    fn next_block(&mut self) -> Pull {
        let want = (self.options.payload_capacity() as u64).min(self.item.remaining()) as usize;
        let current = match self.current.as_mut() {
            Some(current) if want > 0 => current,
            _ => {
                self.phase = Phase::End;
                return self.finish_item();
            }
        };

        let mut payload = vec![0u8; want];
        match read_up_to(&mut current.reader, &mut payload) {
            Ok(0) => {
                debug!(id = self.id, path = %current.path.display(), "stream ended early");
                self.phase = Phase::End;
                self.finish_item()
            }
            Ok(n) => {
                payload.truncate(n);
                self.item.add(n as u64);
                if self.is_folder {
                    self.folder.add(n as u64);
                }
                if n < want || self.item.is_complete() {
                    self.phase = Phase::End;
                }
                Pull {
                    has_more_blocks: true,
                    progress: self.progress(),
                    message: Some(Outbound::Block(DataBlock {
                        session_id: self.id,
                        payload,
                    })),
                }
            }
            Err(e) => {
                let e = ItemError::ItemReadFailed {
                    path: current.path.clone(),
                    message: e.to_string(),
                };
                warn!(id = self.id, error = %e, "read failed, ending item");
                self.phase = Phase::End;
                self.finish_item()
            }
        }
    }

    /// Close the current item, then announce the next one or end the transfer.
    fn finish_item(&mut self) -> Pull {
        self.current = None;
        if self.is_folder {
            // Bytes an item promised but never delivered
            self.folder.total = self.folder.total.saturating_sub(self.item.remaining());
        }

        if self.is_folder && self.cursor < self.leaf_files.len() {
            self.item.reset();
            self.phase = Phase::Metadata;
            return self.next_item_header();
        }

        let progress = self.progress();
        self.item.reset();
        self.folder.reset();
        self.leaf_files.clear();
        self.cursor = 0;
        self.phase = Phase::Finished;

        info!(id = self.id, path = %self.source_path.display(), "transfer finished");
        Pull::control(progress, ControlMessage::file_end(self.id))
    }
}

impl Iterator for TransferSession {
    type Item = Result<Outbound, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.phase == Phase::Finished {
            return None;
        }
        match self.pull_next() {
            Ok(pull) => pull.message.map(Ok),
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        if self.phase != Phase::Finished && self.phase != Phase::Initial {
            debug!(id = self.id, phase = ?self.phase, "transfer dropped before completion");
        }
    }
}

/// Fill `buf` until it is full or the reader reports end of stream.
fn read_up_to(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{fields, MessageKind};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn drain(session: &mut TransferSession) -> Vec<Outbound> {
        session.map(|r| r.unwrap()).collect()
    }

    fn kind(msg: &Outbound) -> Option<MessageKind> {
        msg.as_control().map(|c| c.kind)
    }

    fn block_sizes(msgs: &[Outbound]) -> Vec<usize> {
        msgs.iter()
            .filter_map(|m| m.as_block())
            .map(|b| b.payload.len())
            .collect()
    }

    #[test]
    fn test_single_file_sequence() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.txt");
        fs::write(&file, b"0123456789").unwrap();

        let mut session =
            TransferSession::new(5, &file, SessionOptions::with_payload_capacity(8)).unwrap();
        assert!(!session.is_folder());

        let header = session.pull_next().unwrap();
        assert!(!header.has_more_blocks);
        assert_eq!(header.progress, 0);
        let msg = header.message.unwrap();
        let ctrl = msg.as_control().unwrap();
        assert_eq!(ctrl.kind, MessageKind::FileHeader);
        assert_eq!(ctrl.get(fields::NAME).unwrap(), "a.txt");
        assert_eq!(ctrl.get_u64(fields::TOTAL_SIZE).unwrap(), 10);
        assert_eq!(ctrl.get_u64(fields::TOTAL_BLOCKS).unwrap(), 2);
        assert_eq!(session.phase(), Phase::Block);

        let first = session.pull_next().unwrap();
        assert!(first.has_more_blocks);
        assert_eq!(first.progress, 80);
        let block = first.message.unwrap();
        let block = block.as_block().unwrap();
        assert_eq!(block.session_id, 5);
        assert_eq!(block.payload, b"01234567");

        let second = session.pull_next().unwrap();
        assert!(second.has_more_blocks);
        assert_eq!(second.progress, 100);
        assert_eq!(second.message.unwrap().as_block().unwrap().payload, b"89");
        assert_eq!(session.phase(), Phase::End);

        let end = session.pull_next().unwrap();
        assert_eq!(end.progress, 100);
        assert_eq!(kind(end.message.as_ref().unwrap()), Some(MessageKind::FileEnd));
        assert!(session.is_finished());

        let terminal = session.pull_next().unwrap();
        assert!(terminal.is_terminal());
        assert_eq!(terminal.progress, 100);
        assert!(session.pull_next().unwrap().is_terminal());
    }

    #[test]
    fn test_block_count_matches_size() {
        let temp = TempDir::new().unwrap();
        let capacity = 8usize;

        for size in 0..=40usize {
            let file = temp.path().join(format!("f{}", size));
            let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
            fs::write(&file, &data).unwrap();

            let mut session =
                TransferSession::new(1, &file, SessionOptions::with_payload_capacity(capacity))
                    .unwrap();
            let msgs = drain(&mut session);
            let sizes = block_sizes(&msgs);

            assert_eq!(sizes.len(), size.div_ceil(capacity), "size {}", size);
            assert_eq!(sizes.iter().sum::<usize>(), size);
            if let Some(&last) = sizes.last() {
                let expected = if size % capacity == 0 { capacity } else { size % capacity };
                assert_eq!(last, expected);
            }

            let header = msgs[0].as_control().unwrap();
            assert_eq!(
                header.get_u64(fields::TOTAL_BLOCKS).unwrap(),
                sizes.len() as u64
            );

            let bytes: Vec<u8> = msgs
                .iter()
                .filter_map(|m| m.as_block())
                .flat_map(|b| b.payload.clone())
                .collect();
            assert_eq!(bytes, data);
        }
    }

    #[test]
    fn test_block_size_includes_id_prefix() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("f");
        fs::write(&file, vec![1u8; 100]).unwrap();

        let options = SessionOptions::with_block_size(32);
        assert_eq!(options.payload_capacity(), 28);

        let mut session = TransferSession::new(1, &file, options).unwrap();
        for msg in drain(&mut session) {
            if let Outbound::Block(block) = msg {
                assert!(block.to_bytes().len() <= 32);
            }
        }
    }

    #[test]
    fn test_folder_example_sequence() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("share");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), b"0123456789").unwrap();
        fs::write(root.join("b.txt"), b"").unwrap();

        let mut session =
            TransferSession::new(9, &root, SessionOptions::with_payload_capacity(8)).unwrap();
        assert!(session.is_folder());
        let msgs = drain(&mut session);
        assert_eq!(msgs.len(), 6);

        let dir = msgs[0].as_control().unwrap();
        assert_eq!(dir.kind, MessageKind::DirectoryHeader);
        assert_eq!(dir.get_u64(fields::TOTAL_SIZE).unwrap(), 10);
        assert_eq!(dir.get(fields::NAME).unwrap(), "share");
        assert_eq!(dir.get_u64(fields::TOTAL_PATHS).unwrap(), 1);
        assert!(dir.leaf_paths().unwrap().is_empty());

        let a = msgs[1].as_control().unwrap();
        assert_eq!(a.kind, MessageKind::DirectoryItemHeader);
        assert_eq!(a.get(fields::PATH).unwrap(), "a.txt");
        assert_eq!(a.get_u64(fields::TOTAL_SIZE).unwrap(), 10);
        assert_eq!(a.get_u64(fields::TOTAL_BLOCKS).unwrap(), 2);

        assert_eq!(msgs[2].as_block().unwrap().payload.len(), 8);
        assert_eq!(msgs[3].as_block().unwrap().payload.len(), 2);

        let b = msgs[4].as_control().unwrap();
        assert_eq!(b.kind, MessageKind::DirectoryItemHeader);
        assert_eq!(b.get(fields::PATH).unwrap(), "b.txt");
        assert_eq!(b.get_u64(fields::TOTAL_SIZE).unwrap(), 0);
        assert_eq!(b.get_u64(fields::TOTAL_BLOCKS).unwrap(), 0);

        assert_eq!(kind(&msgs[5]), Some(MessageKind::FileEnd));
    }

    #[test]
    fn test_folder_structure_and_order() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("tree");
        fs::create_dir_all(root.join("x/y")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("x/y/deep.bin"), vec![7u8; 20]).unwrap();
        fs::write(root.join("x/mid.txt"), b"mid").unwrap();
        fs::write(root.join("top.txt"), b"top").unwrap();

        let mut session =
            TransferSession::new(2, &root, SessionOptions::with_payload_capacity(8)).unwrap();
        let msgs = drain(&mut session);

        let dir = msgs[0].as_control().unwrap();
        assert_eq!(dir.leaf_paths().unwrap(), vec!["empty", "x/y"]);
        assert_eq!(dir.get_u64(fields::TOTAL_PATHS).unwrap(), 4);

        let headers: Vec<&str> = msgs
            .iter()
            .filter_map(|m| m.as_control())
            .filter(|c| c.kind == MessageKind::DirectoryItemHeader)
            .map(|c| c.get(fields::PATH).unwrap())
            .collect();
        assert_eq!(headers, vec!["top.txt", "x/mid.txt", "x/y/deep.bin"]);

        // Each item's blocks follow its own header and precede the next one
        let mut current: Option<String> = None;
        let mut received = std::collections::HashMap::<String, usize>::new();
        for msg in &msgs[1..] {
            match msg {
                Outbound::Control(c) if c.kind == MessageKind::DirectoryItemHeader => {
                    current = Some(c.get(fields::PATH).unwrap().to_string());
                }
                Outbound::Block(b) => {
                    *received.entry(current.clone().unwrap()).or_default() += b.payload.len();
                }
                _ => {}
            }
        }
        assert_eq!(received["top.txt"], 3);
        assert_eq!(received["x/mid.txt"], 3);
        assert_eq!(received["x/y/deep.bin"], 20);
        assert_eq!(
            msgs.iter()
                .filter(|m| kind(m) == Some(MessageKind::FileEnd))
                .count(),
            1
        );
        assert_eq!(kind(msgs.last().unwrap()), Some(MessageKind::FileEnd));
    }

    #[test]
    fn test_empty_folder() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("nothing");
        fs::create_dir(&root).unwrap();

        let mut session = TransferSession::new(1, &root, SessionOptions::default()).unwrap();
        let msgs = drain(&mut session);
        assert_eq!(msgs.len(), 2);
        assert_eq!(kind(&msgs[0]), Some(MessageKind::DirectoryHeader));
        assert_eq!(kind(&msgs[1]), Some(MessageKind::FileEnd));
    }

    #[test]
    fn test_folder_progress_reaches_100() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("p");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a"), vec![0u8; 30]).unwrap();
        fs::write(root.join("b"), vec![0u8; 10]).unwrap();

        let mut session =
            TransferSession::new(1, &root, SessionOptions::with_payload_capacity(10)).unwrap();
        let mut last = 0;
        loop {
            let pull = session.pull_next().unwrap();
            if pull.is_terminal() {
                break;
            }
            assert!(pull.progress >= last);
            last = pull.progress;
        }
        assert_eq!(last, 100);
    }

    /// Wraps the local filesystem and injects failures for chosen files.
    struct FaultySource {
        fail_open: Option<PathBuf>,
        fail_read_after: Option<(PathBuf, usize)>,
        dropped: Arc<AtomicBool>,
    }

    impl FaultySource {
        fn new() -> Self {
            Self {
                fail_open: None,
                fail_read_after: None,
                dropped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    struct FlakyReader {
        inner: fs::File,
        budget: usize,
        dropped: Arc<AtomicBool>,
    }

    impl Read for FlakyReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk on fire"));
            }
            let limit = buf.len().min(self.budget);
            let n = self.inner.read(&mut buf[..limit])?;
            self.budget -= n;
            Ok(n)
        }
    }

    impl Drop for FlakyReader {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    impl FileSource for FaultySource {
        fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
            if self.fail_open.as_deref() == Some(path) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"));
            }
            let budget = match &self.fail_read_after {
                Some((p, n)) if p == path => *n,
                _ => usize::MAX,
            };
            Ok(Box::new(FlakyReader {
                inner: fs::File::open(path)?,
                budget,
                dropped: self.dropped.clone(),
            }))
        }

        fn size(&self, path: &Path) -> io::Result<u64> {
            LocalFs.size(path)
        }
    }

    fn three_files(temp: &TempDir) -> PathBuf {
        let root = temp.path().join("three");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("1.txt"), vec![1u8; 12]).unwrap();
        fs::write(root.join("2.txt"), vec![2u8; 12]).unwrap();
        fs::write(root.join("3.txt"), vec![3u8; 12]).unwrap();
        root
    }

    #[test]
    fn test_unopenable_item_is_skipped() {
        let temp = TempDir::new().unwrap();
        let root = three_files(&temp);
        let mut source = FaultySource::new();
        source.fail_open = Some(root.join("2.txt"));

        let mut session = TransferSession::with_source(
            1,
            &root,
            SessionOptions::with_payload_capacity(8),
            Arc::new(source),
        )
        .unwrap();
        let msgs = drain(&mut session);

        let headers: Vec<&str> = msgs
            .iter()
            .filter_map(|m| m.as_control())
            .filter(|c| c.kind == MessageKind::DirectoryItemHeader)
            .map(|c| c.get(fields::PATH).unwrap())
            .collect();
        assert_eq!(headers, vec!["1.txt", "3.txt"]);

        let blocks: Vec<&DataBlock> = msgs.iter().filter_map(|m| m.as_block()).collect();
        assert_eq!(blocks.iter().map(|b| b.payload.len()).sum::<usize>(), 24);
        assert!(blocks.iter().all(|b| b.payload.iter().all(|&x| x != 2)));
        assert_eq!(kind(msgs.last().unwrap()), Some(MessageKind::FileEnd));
    }

    #[test]
    fn test_last_item_unopenable() {
        let temp = TempDir::new().unwrap();
        let root = three_files(&temp);
        let mut source = FaultySource::new();
        source.fail_open = Some(root.join("3.txt"));

        let mut session = TransferSession::with_source(
            1,
            &root,
            SessionOptions::with_payload_capacity(8),
            Arc::new(source),
        )
        .unwrap();
        let msgs = drain(&mut session);
        let end = msgs.last().unwrap();
        assert_eq!(kind(end), Some(MessageKind::FileEnd));
        assert_eq!(block_sizes(&msgs).iter().sum::<usize>(), 24);
    }

    #[test]
    fn test_read_failure_mid_item_continues() {
        let temp = TempDir::new().unwrap();
        let root = three_files(&temp);
        let mut source = FaultySource::new();
        source.fail_read_after = Some((root.join("2.txt"), 8));

        let mut session = TransferSession::with_source(
            1,
            &root,
            SessionOptions::with_payload_capacity(8),
            Arc::new(source),
        )
        .unwrap();

        let mut msgs = Vec::new();
        let mut last_progress = 0;
        loop {
            let pull = session.pull_next().unwrap();
            if pull.is_terminal() {
                break;
            }
            last_progress = pull.progress;
            msgs.push(pull.message.unwrap());
        }

        // 1.txt: 8 + 4, 2.txt: 8 then failure, 3.txt: 8 + 4
        assert_eq!(block_sizes(&msgs), vec![8, 4, 8, 8, 4]);
        assert_eq!(kind(msgs.last().unwrap()), Some(MessageKind::FileEnd));
        assert_eq!(last_progress, 100);
    }

    #[test]
    fn test_single_file_open_failure_sends_header_and_end() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("locked.txt");
        fs::write(&file, b"data").unwrap();
        let mut source = FaultySource::new();
        source.fail_open = Some(file.clone());

        let mut session =
            TransferSession::with_source(1, &file, SessionOptions::default(), Arc::new(source))
                .unwrap();
        let msgs = drain(&mut session);
        assert_eq!(msgs.len(), 2);
        assert_eq!(kind(&msgs[0]), Some(MessageKind::FileHeader));
        assert_eq!(kind(&msgs[1]), Some(MessageKind::FileEnd));
    }

    #[test]
    fn test_file_shrinks_during_transfer() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("shrink");
        fs::write(&file, vec![0u8; 20]).unwrap();

        let mut session =
            TransferSession::new(1, &file, SessionOptions::with_payload_capacity(8)).unwrap();
        session.pull_next().unwrap(); // header records 20 bytes
        fs::write(&file, vec![0u8; 10]).unwrap();

        let msgs = drain(&mut session);
        assert_eq!(block_sizes(&msgs), vec![8, 2]);
        assert_eq!(kind(msgs.last().unwrap()), Some(MessageKind::FileEnd));
    }

    /// Pull the directory header, let `change` edit the tree, then drain.
    fn folder_progress_after(change: impl FnOnce(&Path)) -> (Vec<u8>, Vec<usize>) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("live");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a"), vec![1u8; 10]).unwrap();
        fs::write(root.join("b"), vec![2u8; 10]).unwrap();

        let mut session =
            TransferSession::new(1, &root, SessionOptions::with_payload_capacity(4)).unwrap();
        let header = session.pull_next().unwrap();
        assert_eq!(
            header.message.unwrap().as_control().unwrap().get_u64(fields::TOTAL_SIZE).unwrap(),
            20
        );
        change(&root);

        let mut progress = Vec::new();
        let mut blocks = Vec::new();
        loop {
            let pull = session.pull_next().unwrap();
            if pull.is_terminal() {
                break;
            }
            progress.push(pull.progress);
            if let Some(block) = pull.message.as_ref().and_then(|m| m.as_block()) {
                blocks.push(block.payload.len());
            }
        }
        (progress, blocks)
    }

    #[test]
    fn test_folder_item_shrinks_after_scan() {
        let (progress, blocks) = folder_progress_after(|root| {
            fs::write(root.join("b"), vec![2u8; 4]).unwrap();
        });
        assert_eq!(blocks, vec![4, 4, 2, 4]);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&100));
    }

    #[test]
    fn test_folder_item_grows_after_scan() {
        let (progress, blocks) = folder_progress_after(|root| {
            fs::write(root.join("b"), vec![2u8; 30]).unwrap();
        });
        assert_eq!(blocks.iter().sum::<usize>(), 40);
        // The larger total makes progress step back once at b's header
        assert!(progress.iter().all(|&p| p <= 100));
        assert_eq!(progress.last(), Some(&100));
    }

    #[test]
    fn test_folder_item_removed_after_scan() {
        let (progress, blocks) = folder_progress_after(|root| {
            fs::remove_file(root.join("b")).unwrap();
        });
        assert_eq!(blocks, vec![4, 4, 2]);
        assert_eq!(progress.last(), Some(&100));
    }

    #[test]
    fn test_missing_path_rejected_at_construction() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("ghost");
        let err = TransferSession::new(1, &missing, SessionOptions::default()).unwrap_err();
        assert_eq!(err, TransferError::Scan(ScanError::PathNotFound(missing)));
    }

    #[test]
    fn test_scan_failure_is_fatal() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("vanishing");
        fs::create_dir(&root).unwrap();

        let mut session = TransferSession::new(1, &root, SessionOptions::default()).unwrap();
        fs::remove_dir(&root).unwrap();

        let err = session.pull_next().unwrap_err();
        assert!(matches!(err, TransferError::Scan(ScanError::PathNotFound(_))));
        assert!(session.is_finished());
        assert!(session.next().is_none());
    }

    #[test]
    fn test_drop_releases_stream() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("big");
        fs::write(&file, vec![0u8; 64]).unwrap();
        let source = FaultySource::new();
        let dropped = source.dropped.clone();

        let mut session = TransferSession::with_source(
            1,
            &file,
            SessionOptions::with_payload_capacity(8),
            Arc::new(source),
        )
        .unwrap();
        session.pull_next().unwrap();
        session.pull_next().unwrap();
        assert!(!dropped.load(Ordering::SeqCst));

        drop(session);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stream_closed_after_finish() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("small");
        fs::write(&file, b"abc").unwrap();
        let source = FaultySource::new();
        let dropped = source.dropped.clone();

        let mut session =
            TransferSession::with_source(1, &file, SessionOptions::default(), Arc::new(source))
                .unwrap();
        let _ = drain(&mut session);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
