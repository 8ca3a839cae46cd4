//! Sending side: drains a transfer queue onto one TCP connection
//!
//! The loop is write-then-pull: a session is asked for its next message
//! only after the previous frame has been written to the socket, so a slow
//! receiver throttles disk reads.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use filesync_core::security::PakeRole;
use filesync_core::{
    AesGcmProvider, BufferedTransport, Dispatcher, PlaintextProvider, SecurityProvider,
    SessionOptions, TransferQueue, TransferSession,
};

use crate::net::{connect, pair, write_frame, NetError};

/// Sender configuration
#[derive(Debug, Clone)]
pub struct SendConfig {
    pub session: SessionOptions,
    /// Pairing code; when set, every frame is encrypted
    pub code: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            code: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// One finished outbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransfer {
    pub id: u32,
    pub name: String,
    pub bytes: u64,
}

/// Outcome of a send run
#[derive(Debug, Default)]
pub struct SendReport {
    pub sent: Vec<SentTransfer>,
    /// Paths that could not be sent, with the reason
    pub failed: Vec<(PathBuf, String)>,
}

/// Connect to `addr` and send every path in order
pub async fn send_paths(addr: SocketAddr, paths: &[PathBuf], config: &SendConfig) -> Result<SendReport, NetError> {
    let mut queue = TransferQueue::new(config.session);
    for path in paths {
        queue.push(path)?;
    }

    let mut stream = connect(addr, config.connect_timeout).await?;
    let report = send_queue(&mut stream, &mut queue, config).await?;
    stream.shutdown().await.map_err(NetError::Send)?;
    Ok(report)
}

/// Send a prepared queue over an established stream
pub async fn send_queue(
    stream: &mut TcpStream,
    queue: &mut TransferQueue,
    config: &SendConfig,
) -> Result<SendReport, NetError> {
    let provider: Arc<dyn SecurityProvider> = match &config.code {
        Some(code) => Arc::new(AesGcmProvider::new(&pair(stream, PakeRole::Sender, code).await?)),
        None => Arc::new(PlaintextProvider),
    };
    let encrypt = config.code.is_some();
    let (mut dispatcher, _events) = Dispatcher::new(BufferedTransport::new(), provider);

    let mut report = SendReport::default();
    loop {
        let path = match queue.pending().next() {
            Some(item) => item.path.clone(),
            None => break,
        };
        let Some(next) = queue.next_session() else {
            break;
        };
        let mut session = match next {
            Ok(session) => session,
            Err(e) => {
                warn!("skipping {:?}: {}", path, e);
                report.failed.push((path, e.to_string()));
                continue;
            }
        };

        match send_session(stream, &mut dispatcher, &mut session, encrypt).await {
            Ok(bytes) => {
                info!(id = session.id(), name = session.name(), bytes, "sent");
                report.sent.push(SentTransfer {
                    id: session.id(),
                    name: session.name().to_string(),
                    bytes,
                });
            }
            Err(NetError::Transfer(e)) => {
                error!(id = session.id(), "transfer aborted: {}", e);
                report.failed.push((path, e.to_string()));
            }
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}

async fn send_session(
    stream: &mut TcpStream,
    dispatcher: &mut Dispatcher<BufferedTransport>,
    session: &mut TransferSession,
    encrypt: bool,
) -> Result<u64, NetError> {
    let mut bytes = 0u64;
    let mut last_progress = 0;

    loop {
        let pull = session.pull_next()?;
        let Some(message) = pull.message else {
            break;
        };

        if let Some(block) = message.as_block() {
            bytes += block.payload.len() as u64;
        }
        dispatcher.send_outbound(&message, encrypt)?;
        while let Some(frame) = dispatcher.transport_mut().pop() {
            write_frame(stream, &frame).await?;
        }

        if pull.progress / 10 != last_progress / 10 {
            debug!(id = session.id(), progress = pull.progress, "sending");
        }
        last_progress = pull.progress;
    }

    Ok(bytes)
}
