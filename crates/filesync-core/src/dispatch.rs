//! Message dispatcher
//!
//! Sits between transfer sessions and a byte transport:
//!
//! ```text
//!   send(payload) ──► frame::encode ──► Transport::write
//!
//!   on_receive(raw) ──► frame::decode ──┐
//!   report(event) ──────────────────────┼──► crossbeam channel ──► consumer
//!                                       │    (DispatchEvent)
//! ```
//!
//! Decoded messages, decode failures and transport conditions all arrive on
//! one tagged channel, so a consumer handles them in a single loop.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::error::{DispatchError, FrameError, TransportEvent};
use crate::frame::{self, Flags, UserMessage};
use crate::message::Outbound;
use crate::security::SecurityProvider;

/// Byte sink for encoded frames
pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// In-memory transport that queues whole frames until drained
#[derive(Debug, Default)]
pub struct BufferedTransport {
    frames: VecDeque<Vec<u8>>,
}

impl BufferedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.frames.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.frames.drain(..)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Transport for BufferedTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.frames.push_back(bytes.to_vec());
        Ok(())
    }
}

/// Everything the receiving side of a dispatcher can observe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    Message(UserMessage),
    DecodeFailed(FrameError),
    Transport(TransportEvent),
}

/// Frames outbound payloads and decodes inbound bytes
pub struct Dispatcher<T: Transport> {
    transport: T,
    provider: Arc<dyn SecurityProvider>,
    events: Sender<DispatchEvent>,
}

impl<T: Transport> Dispatcher<T> {
    /// Create a dispatcher and the receiving end of its event channel
    pub fn new(transport: T, provider: Arc<dyn SecurityProvider>) -> (Self, Receiver<DispatchEvent>) {
        let (events, rx) = unbounded();
        (
            Self {
                transport,
                provider,
                events,
            },
            rx,
        )
    }

    /// Frame `payload` and hand it to the transport
    pub fn send(&mut self, payload: &[u8], want_encrypt: bool, want_binary: bool) -> Result<(), DispatchError> {
        let mut flags = Flags::NONE;
        if want_binary {
            flags |= Flags::BINARY;
        }
        if want_encrypt {
            flags |= Flags::ENCRYPTED;
        }

        let msg = frame::encode(payload, flags, self.provider.as_ref())?;
        let bytes = msg.to_bytes();
        trace!(len = bytes.len(), ?flags, "sending frame");
        self.transport.write(&bytes)?;
        Ok(())
    }

    /// Send a session message: control text as a plain frame, data blocks as `BINARY`
    pub fn send_outbound(&mut self, outbound: &Outbound, encrypt: bool) -> Result<(), DispatchError> {
        let payload = outbound.to_bytes()?;
        self.send(&payload, encrypt, outbound.is_binary())
    }

    /// Decode one complete frame and publish the result
    pub fn on_receive(&self, raw: &[u8]) {
        let event = match frame::decode(raw, self.provider.as_ref()) {
            Ok(msg) => DispatchEvent::Message(msg),
            Err(e) => {
                warn!(kind = ?e.kind(), error = %e, "dropping undecodable frame");
                DispatchEvent::DecodeFailed(e)
            }
        };
        self.publish(event);
    }

    /// Forward a transport condition unchanged
    pub fn report(&self, event: TransportEvent) {
        debug!(?event, "transport event");
        self.publish(DispatchEvent::Transport(event));
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn publish(&self, event: DispatchEvent) {
        if self.events.send(event).is_err() {
            trace!("dispatch event dropped, no consumer");
        }
    }
}
