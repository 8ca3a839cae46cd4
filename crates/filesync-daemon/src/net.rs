//! TCP networking layer
//!
//! Frames travel back to back on a plain TCP stream. Each frame carries its
//! own body length, so reading one is: 8-byte header, validate, body.
//!
//! # Pairing
//!
//! When both peers hold a pairing code, they first swap one SPAKE2 message
//! each (raw, unframed) and derive the AES-256-GCM session key from it.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use filesync_core::security::{PakeError, PakeHandshake, PakeRole, KEY_SIZE, PAKE_MESSAGE_SIZE};
use filesync_core::{
    AssembleError, ConnectError, DispatchError, FrameError, FrameHeader, RecvError,
    TransferError, HEADER_LEN,
};

/// Daemon-side transfer errors
#[derive(Debug, Error)]
pub enum NetError {
    #[error("connect failed: {} (code {})", .0, .0.code())]
    Connect(ConnectError),

    #[error("receive failed: {} (code {})", .0, .0.code())]
    Recv(RecvError),

    #[error("send failed: {0}")]
    Send(io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("pairing failed: {0}")]
    Pake(#[from] PakeError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Assemble(#[from] AssembleError),

    #[error("peer closed with {} transfer(s) unfinished", .0.len())]
    Incomplete(Vec<PathBuf>),
}

/// Connect with a deadline
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, NetError> {
    debug!("connecting to {}", addr);
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(NetError::Connect(ConnectError::from_io(&e))),
        Err(_) => return Err(NetError::Connect(ConnectError::TimedOut)),
    };
    stream
        .set_nodelay(true)
        .map_err(|e| NetError::Connect(ConnectError::from_io(&e)))?;
    info!("connected to {}", addr);
    Ok(stream)
}

/// Write one encoded frame
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await.map_err(NetError::Send)
}

/// Read one whole frame (header + body).
///
/// Returns `Ok(None)` only when the peer closed the stream cleanly between
/// frames. A stream ending inside a header or body is an error. The header
/// is validated before the body is allocated.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Vec<u8>>, NetError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut header_buf[filled..]).await {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(FrameError::Truncated {
                    needed: HEADER_LEN,
                    available: filled,
                }
                .into())
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(NetError::Recv(RecvError::from_io(&e))),
        }
    }

    let header = FrameHeader::peek(&header_buf).ok_or(FrameError::Truncated {
        needed: HEADER_LEN,
        available: 0,
    })?;
    header.validate()?;

    let length = header.length as usize;
    if length > max_frame_size {
        return Err(FrameError::TooLarge {
            size: length,
            max: max_frame_size,
        }
        .into());
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + length);
    frame.extend_from_slice(&header_buf);
    frame.resize(HEADER_LEN + length, 0);
    reader
        .read_exact(&mut frame[HEADER_LEN..])
        .await
        .map_err(|e| NetError::Recv(RecvError::from_io(&e)))?;

    Ok(Some(frame))
}

/// Run SPAKE2 over the raw stream and return the shared key
pub async fn pair<S>(stream: &mut S, role: PakeRole, code: &str) -> Result<[u8; KEY_SIZE], NetError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = PakeHandshake::start(role, code);
    stream
        .write_all(handshake.outbound_message())
        .await
        .map_err(NetError::Send)?;

    let mut peer = [0u8; PAKE_MESSAGE_SIZE];
    stream
        .read_exact(&mut peer)
        .await
        .map_err(|e| NetError::Recv(RecvError::from_io(&e)))?;

    let key = handshake.finish(&peer)?;
    debug!(fingerprint = %hex::encode(&filesync_core::security::checksum(&key)[..4]), "paired");
    Ok(key)
}
