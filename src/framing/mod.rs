//! # Wire framing
//!
//! bunnyrs speaks two wire conventions that are **not** interoperable. A server
//! and its clients must be configured with the same [`Framing`]; nothing on the
//! wire identifies which one is in use.
//!
//! ```text
//! LengthPrefixed:  ┌──────────────┬───────────────────────┐
//!                  │ len: u32 BE  │ payload (len bytes)   │   len <= 100 MiB
//!                  └──────────────┴───────────────────────┘
//!
//! Unframed:        ┌───────────────────────────────────────┐
//!                  │ raw bytes, ended by a short read / EOF │
//!                  └───────────────────────────────────────┘
//! ```
//!
//! The unframed mode cannot separate two messages written back to back: if both
//! arrive in one read they come out as one message. That mode exists for
//! compatibility with older line-less clients and is kept as is.

use std::fmt;
use std::io;

use clap::ValueEnum;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted in length-prefixed mode.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Chunk size the server uses when reading unframed shell commands.
pub const SERVER_CHUNK_SIZE: usize = 64;

/// Chunk size the client uses when reading unframed responses.
pub const CLIENT_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer declared (or we tried to send) a frame above [`MAX_FRAME_LEN`].
    #[error("oversized frame: {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Protocol errors are fatal to the connection but are not transport failures.
    pub fn is_protocol(&self) -> bool {
        matches!(self, FrameError::Oversized { .. })
    }
}

/// The wire convention used on one connection, fixed when it is set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Framing {
    /// 4-byte big-endian length header followed by the payload.
    #[default]
    #[value(name = "framed")]
    LengthPrefixed,
    /// Raw bytes; a message ends at a short read or at connection close.
    #[value(name = "unframed")]
    Unframed,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::LengthPrefixed => write!(f, "framed"),
            Framing::Unframed => write!(f, "unframed"),
        }
    }
}

/// Writes `payload` behind a 4-byte big-endian length prefix.
///
/// A peer that has gone away surfaces as [`FrameError::Io`] (usually
/// `BrokenPipe` or `ConnectionReset`); the caller is expected to drop the
/// connection.
pub async fn send_framed<W>(conn: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversized {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let header = (payload.len() as u32).to_be_bytes();
    let mut packet = Vec::with_capacity(header.len() + payload.len());
    packet.extend_from_slice(&header);
    packet.extend_from_slice(payload);

    conn.write_all(&packet).await?;
    conn.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before the
/// first header byte. A connection that dies part way through a header or body
/// is an [`FrameError::Io`] with `UnexpectedEof`.
pub async fn recv_framed<R>(conn: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let first = conn.read(&mut header).await?;
    if first == 0 {
        return Ok(None);
    }
    if first < header.len() {
        conn.read_exact(&mut header[first..]).await?;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut body = vec![0u8; len];
    conn.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Reads raw bytes `chunk_size` at a time until a read comes back short or the
/// peer closes.
///
/// An empty result means the peer is gone; there is no such thing as an empty
/// unframed message.
pub async fn recv_unbounded<R>(conn: &mut R, chunk_size: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut accumulated = Vec::new();
    let mut chunk = vec![0u8; chunk_size.max(1)];
    loop {
        let n = conn.read(&mut chunk).await?;
        accumulated.extend_from_slice(&chunk[..n]);
        if n < chunk.len() {
            break;
        }
    }
    Ok(accumulated)
}

/// Writes raw bytes with no header.
pub async fn send_unframed<W>(conn: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    conn.write_all(payload).await?;
    conn.flush().await?;
    Ok(())
}

/// A byte stream paired with the framing chosen for it.
///
/// Both sides of a bunnyrs conversation go through this type so the framing
/// decision is made once, when the connection is set up.
pub struct Transport<S> {
    stream: S,
    framing: Framing,
    chunk_size: usize,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, framing: Framing, chunk_size: usize) -> Self {
        Self {
            stream,
            framing,
            chunk_size,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        match self.framing {
            Framing::LengthPrefixed => send_framed(&mut self.stream, payload).await,
            Framing::Unframed => send_unframed(&mut self.stream, payload).await,
        }
    }

    /// Receives one message, or `None` once the peer has disconnected.
    ///
    /// In framed mode `Some(vec![])` is a real, empty message. In unframed mode
    /// an empty read is always reported as `None`.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        match self.framing {
            Framing::LengthPrefixed => recv_framed(&mut self.stream).await,
            Framing::Unframed => {
                let bytes = recv_unbounded(&mut self.stream, self.chunk_size).await?;
                Ok(if bytes.is_empty() { None } else { Some(bytes) })
            }
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
