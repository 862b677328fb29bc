//! # bunnyrs client
//!
//! Connects to a bunnyrs server and runs the request/response loop:
//!
//! ```text
//! ┌──────────┐  "> " + line   ┌──────────┐   framed / unframed   ┌──────────┐
//! │ Operator │───────────────►│  Client  │──────────────────────►│  Server  │
//! │ terminal │◄───────────────│          │◄──────────────────────│          │
//! └──────────┘    response    └──────────┘                       └──────────┘
//! ```
//!
//! The client always waits for a server message before prompting, so the
//! Execute profile prints its single result and the Shell profile prints its
//! banner before the first prompt.
//!
//! ## Example Usage
//!
//! ```bash
//! bunnyrs -t 127.0.0.1 -p 9000
//! bunnyrs -t 127.0.0.1 -p 9000 --framing unframed
//! ```

use std::io::{self, Write};
use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::framing::{CLIENT_CHUNK_SIZE, FrameError, Framing, Transport};
use crate::style;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Couldn't connect to {addr}")]
    Refused { addr: SocketAddr },

    #[error("Connection error: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Receive error: {0}")]
    Receive(#[source] FrameError),

    #[error("terminal error: {0}")]
    Terminal(#[from] io::Error),
}

/// How the interactive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// The server closed the connection or could no longer be reached.
    Disconnected,
    /// Interrupted, or the operator's input ended.
    Terminated,
}

pub struct Client {
    transport: Transport<TcpStream>,
    addr: SocketAddr,
}

impl Client {
    /// Dials the configured server.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let addr = config.socket_addr();
        info!("Connecting to {} ({} framing)", addr, config.framing());
        let stream = TcpStream::connect(addr).await.map_err(|source| {
            if source.kind() == io::ErrorKind::ConnectionRefused {
                ClientError::Refused { addr }
            } else {
                ClientError::Connect { addr, source }
            }
        })?;
        info!("Connected to {}", addr);

        Ok(Self {
            transport: Transport::new(stream, config.framing(), CLIENT_CHUNK_SIZE),
            addr,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the prompt loop, reading operator lines from `input` and writing
    /// everything shown to the operator to `output`.
    ///
    /// Returns when the server disconnects, `input` ends, or `shutdown` fires.
    pub async fn run<I, O>(
        mut self,
        input: I,
        mut output: O,
        shutdown: CancellationToken,
    ) -> Result<ClientExit, ClientError>
    where
        I: AsyncBufRead + Unpin,
        O: Write,
    {
        let mut lines = input.lines();
        let mut first = true;

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return terminated(&mut output),
                received = self.transport.recv() => received,
            };

            let response = match received {
                Ok(Some(bytes)) if !bytes.is_empty() => String::from_utf8_lossy(&bytes).into_owned(),
                Ok(_) => return disconnected(&mut output, self.addr),
                Err(FrameError::Io(e)) if is_disconnect(&e) => {
                    return disconnected(&mut output, self.addr);
                }
                Err(e) => return Err(ClientError::Receive(e)),
            };

            render_response(&mut output, &response, first)?;
            first = false;

            // Prompt until there is something that can be sent.
            loop {
                write!(output, "{}", style::pink("> "))?;
                output.flush()?;

                let line = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return terminated(&mut output),
                    line = lines.next_line() => line?,
                };
                let Some(line) = line else {
                    return terminated(&mut output);
                };

                // An empty unframed write puts nothing on the wire and the
                // server would never answer.
                if line.is_empty() && self.transport.framing() == Framing::Unframed {
                    continue;
                }

                if let Err(e) = self.transport.send(line.as_bytes()).await {
                    warn!("Send to {} failed: {}", self.addr, e);
                    writeln!(output, "{}", style::red("Couldn't reach server"))?;
                    return Ok(ClientExit::Disconnected);
                }
                break;
            }
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

fn disconnected<O: Write>(output: &mut O, addr: SocketAddr) -> Result<ClientExit, ClientError> {
    info!("Disconnected from {}", addr);
    writeln!(output, "{}", style::red("Disconnected from target"))?;
    Ok(ClientExit::Disconnected)
}

fn terminated<O: Write>(output: &mut O) -> Result<ClientExit, ClientError> {
    info!("Client terminated by operator");
    writeln!(output, "\n{}", style::red("Client terminated."))?;
    Ok(ClientExit::Terminated)
}

/// Prints one server message. The very first message has its first line
/// highlighted, which is where the server puts its header or banner.
fn render_response<O: Write>(output: &mut O, response: &str, first: bool) -> io::Result<()> {
    if !first {
        return writeln!(output, "{response}");
    }
    match response.find('\n') {
        Some(idx) => {
            let (head, rest) = response.split_at(idx + 1);
            write!(output, "{}", style::pink(head))?;
            writeln!(output, "{rest}")
        }
        None => writeln!(output, "{}", style::pink(response)),
    }
}

/// Dials the server and runs the loop on the process's stdin and stdout.
pub async fn run_client(
    config: ClientConfig,
    shutdown: CancellationToken,
) -> Result<ClientExit, ClientError> {
    let client = Client::connect(&config).await?;
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    client.run(stdin, io::stdout(), shutdown).await
}
