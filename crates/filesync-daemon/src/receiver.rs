//! Receiving side: accepts connections and rebuilds transfers on disk

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use filesync_core::security::PakeRole;
use filesync_core::{
    AesGcmProvider, AssembleError, Assembler, BufferedTransport, DispatchEvent, Dispatcher,
    PlaintextProvider, Received, RecvError, SecurityProvider, TransportEvent, MAX_FRAME_SIZE,
};

use crate::net::{pair, read_frame, NetError};

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    /// Destination directory, created if missing
    pub dest: PathBuf,
    pub overwrite: bool,
    /// Pairing code; must match the sender's
    pub code: Option<String>,
    pub max_frame_size: usize,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            dest: PathBuf::from("."),
            overwrite: false,
            code: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Accept a single connection and receive everything it carries
pub async fn receive_once(listener: &TcpListener, config: &ReceiveConfig) -> Result<Vec<Received>, NetError> {
    let (stream, peer) = listener
        .accept()
        .await
        .map_err(|e| NetError::Recv(RecvError::from_io(&e)))?;
    info!("connection from {}", peer);
    handle_connection(stream, config).await
}

/// Delay between failed accepts: doubles from `ACCEPT_BACKOFF_MIN` up to
/// `ACCEPT_BACKOFF_MAX`, and resets after a successful accept.
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(100);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

impl AcceptBackoff {
    fn new() -> Self {
        Self {
            next: ACCEPT_BACKOFF_MIN,
        }
    }

    fn failed(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(ACCEPT_BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = ACCEPT_BACKOFF_MIN;
    }
}

/// Accept connections one after another until the task is cancelled
pub async fn serve(addr: SocketAddr, config: ReceiveConfig) -> Result<(), NetError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| NetError::Connect(filesync_core::ConnectError::from_io(&e)))?;
    info!("listening on {}, saving to {:?}", addr, config.dest);

    let mut backoff = AcceptBackoff::new();
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => {
                backoff.reset();
                accepted
            }
            Err(e) => {
                // EMFILE and friends persist until something is freed
                let delay = backoff.failed();
                error!("accept failed: {}, retrying in {:?}", RecvError::from_io(&e), delay);
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        info!("connection from {}", peer);
        match handle_connection(stream, &config).await {
            Ok(received) => {
                for r in received {
                    info!("received {:?} ({} bytes)", r.path, r.bytes);
                }
            }
            Err(e) => error!("transfer failed: {}", e),
        }
    }
}

/// Receive frames from `stream` until the peer closes it.
///
/// A connection that ends, cleanly or not, while a transfer is still open
/// fails; the partial output is removed before returning.
pub async fn handle_connection(mut stream: TcpStream, config: &ReceiveConfig) -> Result<Vec<Received>, NetError> {
    fs::create_dir_all(&config.dest).map_err(|source| AssembleError::Io {
        path: config.dest.clone(),
        source,
    })?;

    let provider: Arc<dyn SecurityProvider> = match &config.code {
        Some(code) => Arc::new(AesGcmProvider::new(
            &pair(&mut stream, PakeRole::Receiver, code).await?,
        )),
        None => Arc::new(PlaintextProvider),
    };
    let mut assembler = Assembler::new(&config.dest).overwrite(config.overwrite);

    let result = receive_frames(&mut stream, provider, &mut assembler, config.max_frame_size).await;
    if assembler.active_sessions() == 0 {
        return result;
    }

    let partial = assembler.abandon();
    match result {
        Ok(_) => {
            warn!("peer closed with {} transfer(s) incomplete", partial.len());
            Err(NetError::Incomplete(partial))
        }
        Err(e) => Err(e),
    }
}

async fn receive_frames(
    stream: &mut TcpStream,
    provider: Arc<dyn SecurityProvider>,
    assembler: &mut Assembler,
    max_frame_size: usize,
) -> Result<Vec<Received>, NetError> {
    let (dispatcher, events) = Dispatcher::new(BufferedTransport::new(), provider);
    let mut received = Vec::new();

    loop {
        match read_frame(stream, max_frame_size).await {
            Ok(Some(raw)) => dispatcher.on_receive(&raw),
            Ok(None) => dispatcher.report(TransportEvent::Closed),
            Err(NetError::Recv(e)) => dispatcher.report(TransportEvent::RecvFailure(e)),
            Err(e) => return Err(e),
        }

        while let Ok(event) = events.try_recv() {
            match event {
                DispatchEvent::Message(msg) => {
                    if let Some(done) = assembler.accept(&msg)? {
                        received.push(done);
                    }
                }
                DispatchEvent::DecodeFailed(e) => {
                    warn!(kind = ?e.kind(), "rejecting stream: {}", e);
                    return Err(e.into());
                }
                DispatchEvent::Transport(TransportEvent::Closed) => {
                    debug!("peer closed connection");
                    return Ok(received);
                }
                DispatchEvent::Transport(TransportEvent::RecvFailure(e)) => {
                    return Err(NetError::Recv(e));
                }
                DispatchEvent::Transport(TransportEvent::ConnectFailure(e)) => {
                    return Err(NetError::Connect(e));
                }
            }
        }
    }
}
