//! One accepted connection and the protocol it runs.
//!
//! ```text
//! Connected ──► Serving ──► Closed
//!     │                        ▲
//!     └── Execute profile ─────┘
//! ```
//!
//! Whatever path leads to `Closed`, the session leaves the registry (which
//! closes the socket) exactly once.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Profile;
use crate::exec::{CommandExecutor, ExecResult};
use crate::framing::{FrameError, Framing, SERVER_CHUNK_SIZE, Transport};
use crate::server::registry::{ConnectionHandle, SessionEntry, SessionRegistry};

pub const EXECUTE_HEADER: &str = "<# Execute #>";
pub const SUDO_REJECTION: &str = "Sudo not supported";

/// Everything a session needs besides its own socket. Shared by all sessions
/// of one server.
pub struct SessionContext {
    pub profile: Profile,
    pub framing: Framing,
    pub executor: Arc<dyn CommandExecutor>,
    pub running_user: String,
    pub registry: SessionRegistry,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The Execute profile delivered its output.
    Completed,
    /// The peer closed the connection.
    PeerClosed,
    /// Server shutdown or `close_all` reached this session.
    Shutdown,
    /// Read or write failed, or the peer broke the framing rules.
    Failed(String),
}

pub struct Session {
    id: Uuid,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    stream: TcpStream,
    cancel: CancellationToken,
}

impl Session {
    /// Wraps an accepted stream and builds the registry entry that lets the
    /// server close it from another task.
    ///
    /// The session's cancellation token is a child of `shutdown`.
    pub fn accept(
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: &CancellationToken,
    ) -> io::Result<(Self, SessionEntry)> {
        let std_stream = stream.into_std()?;
        let handle = Arc::new(ConnectionHandle::new(std_stream.try_clone()?));
        let stream = TcpStream::from_std(std_stream)?;

        let session = Session {
            id: Uuid::new_v4(),
            peer,
            connected_at: Utc::now(),
            stream,
            cancel: shutdown.child_token(),
        };
        let entry = SessionEntry {
            id: session.id,
            peer,
            connected_at: session.connected_at,
            handle,
            cancel: session.cancel.clone(),
        };
        Ok((session, entry))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Serves the connection until it closes, then deregisters it.
    pub async fn run(self, ctx: Arc<SessionContext>) -> CloseReason {
        let Session {
            id,
            peer,
            connected_at,
            stream,
            cancel,
        } = self;
        let mut transport = Transport::new(stream, ctx.framing, SERVER_CHUNK_SIZE);

        let reason = match &ctx.profile {
            Profile::Execute { command } => serve_execute(&mut transport, command, &ctx).await,
            Profile::Shell => serve_shell(&mut transport, peer, &cancel, &ctx).await,
        };

        // Closed: the registry closes the socket, unless close_all already did.
        if !ctx.registry.remove(id) {
            debug!("Session {} was already closed by shutdown", id);
        }
        drop(transport);

        let elapsed = Utc::now().signed_duration_since(connected_at);
        match &reason {
            CloseReason::Failed(e) => warn!(
                "{} disconnected after {}s ({}): {}",
                peer,
                elapsed.num_seconds(),
                id,
                e
            ),
            other => info!(
                "{} disconnected after {}s ({}, {:?})",
                peer,
                elapsed.num_seconds(),
                id,
                other
            ),
        }
        reason
    }
}

async fn serve_execute(
    transport: &mut Transport<TcpStream>,
    command: &str,
    ctx: &SessionContext,
) -> CloseReason {
    let payload = match ctx.executor.execute(command).await {
        Ok(result) => execute_response(&result),
        Err(e) => format!("{EXECUTE_HEADER}\n\n\n{e}"),
    };
    match transport.send(payload.as_bytes()).await {
        Ok(()) => CloseReason::Completed,
        Err(e) => CloseReason::Failed(e.to_string()),
    }
}

async fn serve_shell(
    transport: &mut Transport<TcpStream>,
    peer: SocketAddr,
    cancel: &CancellationToken,
    ctx: &SessionContext,
) -> CloseReason {
    let banner = shell_banner(&ctx.running_user);
    if let Err(e) = transport.send(banner.as_bytes()).await {
        return CloseReason::Failed(e.to_string());
    }

    loop {
        let inbound = tokio::select! {
            biased;
            _ = cancel.cancelled() => return CloseReason::Shutdown,
            inbound = transport.recv() => inbound,
        };

        let bytes = match inbound {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return CloseReason::PeerClosed,
            Err(FrameError::Io(e)) if is_disconnect(&e) => {
                // close_all shuts the socket down under us; report that as shutdown.
                if cancel.is_cancelled() {
                    return CloseReason::Shutdown;
                }
                return CloseReason::PeerClosed;
            }
            Err(e) => return CloseReason::Failed(e.to_string()),
        };

        let command = String::from_utf8_lossy(&bytes).trim().to_string();
        let response = shell_response(&command, ctx.executor.as_ref()).await;
        if !command.is_empty() && response != SUDO_REJECTION {
            info!("{} executed {}", peer, command);
        }

        if let Err(e) = transport.send(response.as_bytes()).await {
            return CloseReason::Failed(e.to_string());
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
            | io::ErrorKind::NotConnected
    )
}

pub fn shell_banner(user: &str) -> String {
    format!("<# Reverse shell as {user} #> ")
}

/// Formats the single message an Execute session sends.
pub fn execute_response(result: &ExecResult) -> String {
    format!(
        "{EXECUTE_HEADER}\n\n{}\n{}",
        result.stdout_lossy(),
        result.stderr_lossy()
    )
}

/// Produces the reply to one shell-profile command.
///
/// Anything mentioning `sudo` is refused before the executor is consulted.
pub async fn shell_response(command: &str, executor: &dyn CommandExecutor) -> String {
    if command.contains("sudo") {
        return SUDO_REJECTION.to_string();
    }
    match executor.execute(command).await {
        Ok(result) if result.failed => format!(
            "{}\n{}\n{}",
            result.stdout_lossy(),
            result.stderr_lossy(),
            result.reason.as_deref().unwrap_or("command failed")
        ),
        Ok(result) => format!("{}\n{}", result.stdout_lossy(), result.stderr_lossy()),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
        result: ExecResult,
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(&self, command: &str) -> Result<ExecResult, ExecError> {
            self.calls.lock().unwrap().push(command.to_string());
            if command.trim().is_empty() {
                return Err(ExecError::InvalidCommand);
            }
            Ok(self.result.clone())
        }
    }

    #[tokio::test]
    async fn test_sudo_is_refused_without_running_anything() {
        let executor = RecordingExecutor::default();
        let reply = shell_response("sudo ls", &executor).await;
        assert_eq!(reply, "Sudo not supported");
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sudo_anywhere_in_the_command_is_refused() {
        let executor = RecordingExecutor::default();
        let reply = shell_response("echo hi && sudo -i", &executor).await;
        assert_eq!(reply, SUDO_REJECTION);
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_successful_command_joins_stdout_and_stderr() {
        let executor = RecordingExecutor {
            result: ExecResult {
                stdout: b"file.txt\n".to_vec(),
                stderr: b"warning\n".to_vec(),
                ..ExecResult::default()
            },
            ..RecordingExecutor::default()
        };
        let reply = shell_response("ls", &executor).await;
        assert_eq!(reply, "file.txt\n\nwarning\n");
        assert_eq!(*executor.calls.lock().unwrap(), vec!["ls".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_command_appends_reason() {
        let executor = RecordingExecutor {
            result: ExecResult {
                stdout: Vec::new(),
                stderr: b"ls: nope: No such file or directory\n".to_vec(),
                failed: true,
                reason: Some("exit status: 2".to_string()),
            },
            ..RecordingExecutor::default()
        };
        let reply = shell_response("ls nope", &executor).await;
        assert_eq!(
            reply,
            "\nls: nope: No such file or directory\n\nexit status: 2"
        );
    }

    #[tokio::test]
    async fn test_empty_command_reports_invalid_command() {
        let executor = RecordingExecutor::default();
        assert_eq!(shell_response("", &executor).await, "command is empty");
    }

    #[test]
    fn test_execute_response_layout() {
        let result = ExecResult {
            stdout: b"ready\n".to_vec(),
            ..ExecResult::default()
        };
        assert_eq!(execute_response(&result), "<# Execute #>\n\nready\n\n");
    }

    #[test]
    fn test_shell_banner_names_the_user() {
        assert_eq!(shell_banner("bunny"), "<# Reverse shell as bunny #> ");
    }
}
