//! FileSync Core - framing, transfer state machine, and crypto
//!
//! This crate turns files and folders into an ordered stream of framed
//! messages and back. It has no networking code; a transport only needs to
//! move whole frames.
//!
//! ```text
//! TransferQueue ─► TransferSession::pull_next ─► Dispatcher::send ─► Transport
//!                                                      │
//!                                         frame::encode + SecurityProvider
//!
//! Transport bytes ─► Dispatcher::on_receive ─► DispatchEvent ─► Assembler
//! ```

pub mod assemble;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod index;
pub mod message;
pub mod path;
pub mod progress;
pub mod queue;
pub mod security;
pub mod session;

pub use assemble::{Assembler, Received};
pub use config::{Config, ConfigError, NetworkConfig, ReceiveConfig, TransferConfig};
pub use dispatch::{BufferedTransport, DispatchEvent, Dispatcher, Transport};
pub use error::*;
pub use frame::{Flags, FrameHeader, UserMessage, HEADER_LEN};
pub use index::{DirectoryIndex, LeafFile};
pub use message::{ControlMessage, DataBlock, MessageKind, Outbound};
pub use progress::{compute_progress, Progress};
pub use queue::TransferQueue;
pub use security::{AesGcmProvider, PlaintextProvider, SecurityProvider};
pub use session::{FileSource, LocalFs, Phase, Pull, SessionOptions, TransferSession};

/// Frame magic number
pub const PROTOCOL_MAGIC: u16 = 0xABCD;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// SHA-256 digest length
pub const DIGEST_LEN: usize = 32;

/// Default data block size on the wire (64 KB)
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Largest frame body accepted from a peer (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;
