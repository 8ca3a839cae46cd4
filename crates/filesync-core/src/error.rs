//! Error types for the FileSync protocol

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Frame decode/encode errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("protocol mismatch (magic {magic:#06x}, version {version})")]
    ProtocolMismatch { magic: u16, version: u8 },

    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("integrity check failed")]
    IntegrityFailure,

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

impl FrameError {
    /// Short classification used when reporting decode failures
    pub fn kind(&self) -> FrameErrorKind {
        match self {
            FrameError::ProtocolMismatch { .. } => FrameErrorKind::ProtocolMismatch,
            FrameError::Truncated { .. } | FrameError::TooLarge { .. } => {
                FrameErrorKind::Truncated
            }
            FrameError::IntegrityFailure | FrameError::Encrypt(_) => {
                FrameErrorKind::IntegrityFailure
            }
        }
    }
}

/// Coarse decode failure category
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameErrorKind {
    ProtocolMismatch,
    Truncated,
    IntegrityFailure,
}

/// Directory scan errors. Fatal to the whole transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("access denied: {0}")]
    AccessDenied(PathBuf),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl ScanError {
    pub fn from_io(path: PathBuf, e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => ScanError::PathNotFound(path),
            io::ErrorKind::PermissionDenied => ScanError::AccessDenied(path),
            _ => ScanError::Io {
                path,
                message: e.to_string(),
            },
        }
    }
}

/// Per-item failures. These skip the item and are only logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ItemError {
    #[error("failed to open {path}: {message}")]
    ItemOpenFailed { path: PathBuf, message: String },

    #[error("failed to read {path}: {message}")]
    ItemReadFailed { path: PathBuf, message: String },
}

/// Path validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path traversal attempt blocked: {0}")]
    Traversal(String),

    #[error("{path} is not under {root}")]
    NotUnderRoot { path: PathBuf, root: PathBuf },

    #[error("path is not valid UTF-8: {0}")]
    NotUtf8(PathBuf),
}

/// Errors surfaced from `TransferSession::pull_next`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Path(#[from] PathError),
}

/// Control message (de)serialization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("data block too short: {0} bytes")]
    ShortBlock(usize),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

impl From<serde_json::Error> for MessageError {
    fn from(e: serde_json::Error) -> Self {
        MessageError::Deserialization(e.to_string())
    }
}

/// Connection-establishment failures reported by a transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection refused")]
    Refused,
    #[error("connection timed out")]
    TimedOut,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("access denied")]
    AccessDenied,
    #[error("address in use")]
    AddrInUse,
    #[error("connection in progress")]
    InProgress,
    #[error("already connected")]
    AlreadyConnected,
    #[error("bad address")]
    BadAddress,
    #[error("interrupted")]
    Interrupted,
    #[error("connect failed: {0}")]
    Other(String),
}

impl ConnectError {
    pub fn from_io(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => ConnectError::Refused,
            io::ErrorKind::TimedOut => ConnectError::TimedOut,
            io::ErrorKind::PermissionDenied => ConnectError::AccessDenied,
            io::ErrorKind::AddrInUse => ConnectError::AddrInUse,
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                ConnectError::BadAddress
            }
            io::ErrorKind::WouldBlock => ConnectError::InProgress,
            io::ErrorKind::Interrupted => ConnectError::Interrupted,
            _ => e
                .raw_os_error()
                .and_then(connect_errno)
                .unwrap_or_else(|| ConnectError::Other(e.to_string())),
        }
    }

    /// Stable numeric code for logs and UI
    pub fn code(&self) -> u16 {
        match self {
            ConnectError::Refused => 10001,
            ConnectError::TimedOut => 10002,
            ConnectError::HostUnreachable => 10003,
            ConnectError::NetworkUnreachable => 10004,
            ConnectError::AccessDenied => 10005,
            ConnectError::AddrInUse => 10006,
            ConnectError::InProgress => 10007,
            ConnectError::AlreadyConnected => 10008,
            ConnectError::BadAddress => 10009,
            ConnectError::Interrupted => 10010,
            ConnectError::Other(_) => 10099,
        }
    }
}

/// Receive-path failures reported by a transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecvError {
    #[error("connection reset by peer")]
    ConnReset,
    #[error("connection aborted")]
    ConnAborted,
    #[error("not connected")]
    NotConnected,
    #[error("network down")]
    NetworkDown,
    #[error("receive timed out")]
    TimedOut,
    #[error("interrupted")]
    Interrupted,
    #[error("socket shut down")]
    Shutdown,
    #[error("network reset")]
    NetworkReset,
    #[error("receive failed: {0}")]
    Other(String),
}

impl RecvError {
    pub fn from_io(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset => RecvError::ConnReset,
            io::ErrorKind::ConnectionAborted => RecvError::ConnAborted,
            io::ErrorKind::NotConnected => RecvError::NotConnected,
            io::ErrorKind::TimedOut => RecvError::TimedOut,
            io::ErrorKind::Interrupted => RecvError::Interrupted,
            io::ErrorKind::BrokenPipe => RecvError::Shutdown,
            _ => e
                .raw_os_error()
                .and_then(recv_errno)
                .unwrap_or_else(|| RecvError::Other(e.to_string())),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            RecvError::ConnReset => 20002,
            RecvError::ConnAborted => 20003,
            RecvError::NotConnected => 20004,
            RecvError::NetworkDown => 20005,
            RecvError::TimedOut => 20006,
            RecvError::Interrupted => 20007,
            RecvError::Shutdown => 20010,
            RecvError::NetworkReset => 20011,
            RecvError::Other(_) => 20099,
        }
    }
}

// Errno values without a stable `io::ErrorKind`
#[cfg(unix)]
fn connect_errno(code: i32) -> Option<ConnectError> {
    match code {
        libc::EHOSTUNREACH => Some(ConnectError::HostUnreachable),
        libc::ENETUNREACH => Some(ConnectError::NetworkUnreachable),
        libc::EISCONN => Some(ConnectError::AlreadyConnected),
        _ => None,
    }
}

#[cfg(not(unix))]
fn connect_errno(_code: i32) -> Option<ConnectError> {
    None
}

#[cfg(unix)]
fn recv_errno(code: i32) -> Option<RecvError> {
    match code {
        libc::ENETDOWN => Some(RecvError::NetworkDown),
        libc::ENETRESET => Some(RecvError::NetworkReset),
        libc::ESHUTDOWN => Some(RecvError::Shutdown),
        _ => None,
    }
}

#[cfg(not(unix))]
fn recv_errno(_code: i32) -> Option<RecvError> {
    None
}

/// Transport-level conditions the dispatcher forwards but never generates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectFailure(ConnectError),
    RecvFailure(RecvError),
    Closed,
}

/// Errors from `Dispatcher::send`
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("transport write failed: {0}")]
    Write(#[from] io::Error),
}

/// Receiving-side reconstruction errors
#[derive(Error, Debug)]
pub enum AssembleError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("data for unknown session {0}")]
    UnknownSession(u32),

    #[error("unexpected {0} message")]
    Unexpected(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
