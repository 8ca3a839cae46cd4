//! Receiving side reconstruction
//!
//! The `Assembler` consumes decoded frames in arrival order and rebuilds
//! the sender's files and folders under a destination directory. Every
//! name and path from the peer goes through `safe_path` before it is used.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::AssembleError;
use crate::frame::UserMessage;
use crate::message::{fields, ControlMessage, DataBlock, MessageKind, Outbound};
use crate::path::{safe_path, validate_filename};
use crate::progress::Progress;

/// A completed incoming transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub session_id: u32,
    /// Final location of the file or folder
    pub path: PathBuf,
    pub is_folder: bool,
    /// File bytes written
    pub bytes: u64,
}

struct OpenFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl OpenFile {
    fn create(path: PathBuf) -> Result<Self, AssembleError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| AssembleError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = File::create(&path).map_err(|source| AssembleError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn close(mut self) -> Result<(), AssembleError> {
        self.writer.flush().map_err(|source| AssembleError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

struct Incoming {
    root: PathBuf,
    is_folder: bool,
    /// The root did not exist before this transfer
    fresh: bool,
    current: Option<OpenFile>,
    progress: Progress,
    written: u64,
}

impl Incoming {
    fn close_current(&mut self) -> Result<(), AssembleError> {
        match self.current.take() {
            Some(file) => file.close(),
            None => Ok(()),
        }
    }
}

/// Rebuilds transfers on disk from an ordered message stream
pub struct Assembler {
    dest: PathBuf,
    overwrite: bool,
    sessions: HashMap<u32, Incoming>,
}

impl Assembler {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self {
            dest: dest.into(),
            overwrite: false,
            sessions: HashMap::new(),
        }
    }

    /// Replace existing files instead of choosing a fresh name
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Receive progress for an active session
    pub fn progress(&self, session_id: u32) -> Option<u8> {
        self.sessions.get(&session_id).map(|s| s.progress.percent())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Apply one decoded frame. Returns the finished transfer on `FileEnd`.
    pub fn accept(&mut self, msg: &UserMessage) -> Result<Option<Received>, AssembleError> {
        let outbound = Outbound::from_frame(&msg.data, msg.is_binary())?;
        self.accept_outbound(outbound)
    }

    pub fn accept_outbound(&mut self, outbound: Outbound) -> Result<Option<Received>, AssembleError> {
        match outbound {
            Outbound::Block(block) => self.on_block(block).map(|_| None),
            Outbound::Control(ctrl) => match ctrl.kind {
                MessageKind::FileHeader => self.on_file_header(&ctrl).map(|_| None),
                MessageKind::DirectoryHeader => self.on_directory_header(&ctrl).map(|_| None),
                MessageKind::DirectoryItemHeader => self.on_item_header(&ctrl).map(|_| None),
                MessageKind::FileEnd => self.on_file_end(&ctrl).map(Some),
            },
        }
    }

    fn on_file_header(&mut self, ctrl: &ControlMessage) -> Result<(), AssembleError> {
        let id = ctrl.id()?;
        let name = ctrl.get(fields::NAME)?;
        let total = ctrl.get_u64(fields::TOTAL_SIZE)?;
        validate_filename(name)?;
        self.ensure_new(id)?;

        let target = self.destination(safe_path(&self.dest, name)?);
        info!(id, path = %target.display(), bytes = total, "receiving file");

        let fresh = !target.exists();
        let file = OpenFile::create(target.clone())?;
        self.begin(
            id,
            Incoming {
                root: target,
                is_folder: false,
                fresh,
                current: Some(file),
                progress: Progress::new(total),
                written: 0,
            },
        )
    }

    fn on_directory_header(&mut self, ctrl: &ControlMessage) -> Result<(), AssembleError> {
        let id = ctrl.id()?;
        let name = ctrl.get(fields::NAME)?;
        let total = ctrl.get_u64(fields::TOTAL_SIZE)?;
        validate_filename(name)?;
        self.ensure_new(id)?;

        let root = self.destination(safe_path(&self.dest, name)?);
        let fresh = !root.exists();
        fs::create_dir_all(&root).map_err(|source| AssembleError::Io {
            path: root.clone(),
            source,
        })?;

        for leaf in ctrl.leaf_paths()? {
            let dir = safe_path(&root, &leaf)?;
            fs::create_dir_all(&dir).map_err(|source| AssembleError::Io { path: dir, source })?;
        }

        info!(id, path = %root.display(), bytes = total, "receiving folder");
        self.begin(
            id,
            Incoming {
                root,
                is_folder: true,
                fresh,
                current: None,
                progress: Progress::new(total),
                written: 0,
            },
        )
    }

    fn on_item_header(&mut self, ctrl: &ControlMessage) -> Result<(), AssembleError> {
        let id = ctrl.id()?;
        let path = ctrl.get(fields::PATH)?;
        let incoming = self
            .sessions
            .get_mut(&id)
            .ok_or(AssembleError::UnknownSession(id))?;
        if !incoming.is_folder {
            return Err(AssembleError::Unexpected(format!(
                "{} for file session {}",
                MessageKind::DirectoryItemHeader,
                id
            )));
        }

        incoming.close_current()?;
        let target = safe_path(&incoming.root, path)?;
        debug!(id, path = %target.display(), "receiving folder item");
        incoming.current = Some(OpenFile::create(target)?);
        Ok(())
    }

    fn on_block(&mut self, block: DataBlock) -> Result<(), AssembleError> {
        let id = block.session_id;
        let incoming = self
            .sessions
            .get_mut(&id)
            .ok_or(AssembleError::UnknownSession(id))?;
        let file = incoming
            .current
            .as_mut()
            .ok_or_else(|| AssembleError::Unexpected(format!("data block for session {} with no open item", id)))?;

        file.writer
            .write_all(&block.payload)
            .map_err(|source| AssembleError::Io {
                path: file.path.clone(),
                source,
            })?;
        incoming.written += block.payload.len() as u64;
        incoming.progress.add(block.payload.len() as u64);
        Ok(())
    }

    fn on_file_end(&mut self, ctrl: &ControlMessage) -> Result<Received, AssembleError> {
        let id = ctrl.id()?;
        let mut incoming = self
            .sessions
            .remove(&id)
            .ok_or(AssembleError::UnknownSession(id))?;
        incoming.close_current()?;

        if incoming.progress.remaining() > 0 {
            warn!(
                id,
                missing = incoming.progress.remaining(),
                "transfer ended short of announced size"
            );
        }
        info!(id, path = %incoming.root.display(), bytes = incoming.written, "transfer received");

        Ok(Received {
            session_id: id,
            path: incoming.root,
            is_folder: incoming.is_folder,
            bytes: incoming.written,
        })
    }

    /// Drop every unfinished transfer and return the roots it had started.
    ///
    /// Partial single files are deleted, as are folders this assembler
    /// created. A folder that already existed (overwrite mode) is left in
    /// place since it may hold files from before.
    pub fn abandon(&mut self) -> Vec<PathBuf> {
        let mut ids: Vec<u32> = self.sessions.keys().copied().collect();
        ids.sort_unstable();

        let mut roots = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(mut incoming) = self.sessions.remove(&id) else {
                continue;
            };
            if let Err(e) = incoming.close_current() {
                debug!(id, error = %e, "closing partial item");
            }

            let removed = match (incoming.is_folder, incoming.fresh) {
                (false, _) => fs::remove_file(&incoming.root).map(|_| true),
                (true, true) => fs::remove_dir_all(&incoming.root).map(|_| true),
                (true, false) => Ok(false),
            };
            match removed {
                Ok(true) => warn!(id, path = %incoming.root.display(), "removed incomplete transfer"),
                Ok(false) => warn!(id, path = %incoming.root.display(), "folder left incomplete"),
                Err(e) => warn!(id, path = %incoming.root.display(), error = %e, "could not remove incomplete transfer"),
            }
            roots.push(incoming.root);
        }
        roots
    }

    fn ensure_new(&self, id: u32) -> Result<(), AssembleError> {
        if self.sessions.contains_key(&id) {
            return Err(AssembleError::Unexpected(format!("header for active session {}", id)));
        }
        Ok(())
    }

    fn begin(&mut self, id: u32, incoming: Incoming) -> Result<(), AssembleError> {
        self.ensure_new(id)?;
        self.sessions.insert(id, incoming);
        Ok(())
    }

    /// Pick where a new top-level file or folder goes
    fn destination(&self, path: PathBuf) -> PathBuf {
        if self.overwrite {
            path
        } else {
            unique_path(path)
        }
    }
}

/// `path` if unused, else `name (1).ext`, `name (2).ext`, ...
fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }

    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    (1u32..)
        .map(|n| {
            let name = match &ext {
                Some(ext) => format!("{} ({}).{}", stem, n, ext),
                None => format!("{} ({})", stem, n),
            };
            parent.join(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}
