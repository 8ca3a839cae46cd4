//! FileSync Daemon - TCP transport and sender/receiver drivers
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │ sender                       │        │ receiver                     │
//! │ TransferQueue                │  TCP   │ read_frame                   │
//! │  └─ TransferSession.pull ────┼───────►│  └─ Dispatcher.on_receive    │
//! │      └─ Dispatcher.send      │ frames │      └─ Assembler            │
//! └──────────────────────────────┘        └──────────────────────────────┘
//! ```
//!
//! With a pairing code, both ends run SPAKE2 before the first frame and
//! encrypt every frame with the derived key.

pub mod net;
pub mod receiver;
pub mod sender;

pub use net::NetError;
pub use receiver::{handle_connection, receive_once, serve, ReceiveConfig};
pub use sender::{send_paths, send_queue, SendConfig, SendReport, SentTransfer};
