//! Shell command execution.
//!
//! The server never talks to the OS directly; it hands command strings to a
//! [`CommandExecutor`]. [`SystemShell`] is the real implementation and runs
//! everything through `sh -c`, so pipes, globbing and redirection behave the way
//! an operator typing into a shell expects.

use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("command is empty")]
    InvalidCommand,
}

/// Captured output of one command invocation.
///
/// A command that ran but exited non-zero, or that could not be launched at all,
/// is still an `ExecResult`: `failed` is set and `reason` says why, and whatever
/// output was produced is kept so it can be shown to the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub failed: bool,
    pub reason: Option<String>,
}

impl ExecResult {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs shell command strings.
///
/// Implementations must reject blank commands with [`ExecError::InvalidCommand`]
/// before doing anything else.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<ExecResult, ExecError>;
}

/// Executes commands with `sh -c`.
///
/// There is no timeout: a command that never returns holds its session forever.
#[derive(Debug, Clone)]
pub struct SystemShell {
    shell: String,
}

impl Default for SystemShell {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl SystemShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a different POSIX-compatible shell binary, invoked as `<shell> -c`.
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl CommandExecutor for SystemShell {
    async fn execute(&self, command: &str) -> Result<ExecResult, ExecError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ExecError::InvalidCommand);
        }

        debug!("running `{}` via {} -c", command, self.shell);
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let result = match output {
            Ok(output) => {
                let failed = !output.status.success();
                let reason = failed.then(|| output.status.to_string());
                ExecResult {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    failed,
                    reason,
                }
            }
            Err(e) => ExecResult {
                failed: true,
                reason: Some(format!("failed to launch {}: {e}", self.shell)),
                ..ExecResult::default()
            },
        };
        Ok(result)
    }
}

/// Name of the user the server runs as, for the shell banner.
///
/// Asks `whoami` first, then `$USER`, and settles for `"unknown"`.
pub async fn running_user(executor: &dyn CommandExecutor) -> String {
    if let Ok(result) = executor.execute("whoami").await {
        let name = result.stdout_lossy().trim().replace('\n', "");
        if !result.failed && !name.is_empty() {
            return name;
        }
    }
    std::env::var("USER")
        .ok()
        .filter(|user| !user.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_rejects_empty_command() {
        let shell = SystemShell::new();
        assert_eq!(shell.execute("").await, Err(ExecError::InvalidCommand));
    }

    #[tokio::test]
    async fn test_execute_rejects_whitespace_only_command() {
        let shell = SystemShell::new();
        assert_eq!(shell.execute("   ").await, Err(ExecError::InvalidCommand));
        assert_eq!(shell.execute("\t\n").await, Err(ExecError::InvalidCommand));
    }

    #[tokio::test]
    async fn test_execute_echo_captures_stdout() {
        let shell = SystemShell::new();
        let result = shell.execute("echo hi").await.unwrap();
        assert_eq!(result.stdout, b"hi\n");
        assert!(result.stderr.is_empty());
        assert!(!result.failed);
        assert_eq!(result.reason, None);
    }

    #[tokio::test]
    async fn test_execute_keeps_stderr_separate() {
        let shell = SystemShell::new();
        let result = shell.execute("echo out; echo err 1>&2").await.unwrap();
        assert_eq!(result.stdout_lossy(), "out\n");
        assert_eq!(result.stderr_lossy(), "err\n");
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit_is_reported_not_raised() {
        let shell = SystemShell::new();
        let result = shell.execute("echo partial; exit 3").await.unwrap();
        assert!(result.failed);
        assert_eq!(result.stdout_lossy(), "partial\n");
        let reason = result.reason.expect("failure reason");
        assert!(reason.contains('3'), "reason should carry the exit code: {reason}");
    }

    #[tokio::test]
    async fn test_execute_launch_failure_is_reported_not_raised() {
        let shell = SystemShell::with_shell("/nonexistent/bunnyrs-shell");
        let result = shell.execute("true").await.unwrap();
        assert!(result.failed);
        assert!(result.stdout.is_empty());
        assert!(result.reason.unwrap().contains("failed to launch"));
    }

    #[tokio::test]
    async fn test_running_user_is_never_empty() {
        let shell = SystemShell::new();
        let user = running_user(&shell).await;
        assert!(!user.is_empty());
        assert!(!user.contains('\n'));
    }
}
