//! # bunnyrs server
//!
//! Accepts TCP connections and serves each one on its own task according to the
//! configured [`Profile`]:
//!
//! - **Execute**: run the fixed command, send `<# Execute #>` plus its output,
//!   close the connection.
//! - **Shell**: greet with `<# Reverse shell as <user> #> `, then run every
//!   received command through `sh -c` and send back stdout and stderr.
//!
//! ## Lifecycle
//!
//! ```text
//!  Server::bind ──► Server::run (accept loop) ──► Server::wait
//!                        │   ▲
//!           accept ──────┘   └── shutdown token cancelled
//!              │                      │
//!              ▼                      ▼
//!   registry.add + spawn       Server::shutdown
//!        Session::run           ├─ cancel token (no-op if already)
//!              │                ├─ registry.close_all
//!              ▼                └─ release listener
//!   registry.remove (once)
//! ```
//!
//! ## Example Usage
//!
//! ```bash
//! # Run `ls -la` for every client
//! bunnyrs -s -e "ls -la" -p 9000
//!
//! # Interactive shell for every client, legacy wire format
//! bunnyrs -s -sh -p 9000 --framing unframed
//! ```

pub mod registry;
pub mod session;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::{Profile, ServerConfig};
use crate::exec::{self, CommandExecutor};

pub use registry::{ConnectionHandle, RegistryError, SessionEntry, SessionRegistry};
pub use session::{CloseReason, Session, SessionContext};

/// Pause after a failed `accept` so a persistent error does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{addr} already in use")]
    AddrInUse { addr: SocketAddr },

    #[error("Bind error: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

struct Inner {
    config: ServerConfig,
    local_addr: SocketAddr,
    /// Present until the accept loop takes it, or until shutdown drops it.
    listener: Mutex<Option<TcpListener>>,
    registry: SessionRegistry,
    shutdown: CancellationToken,
    shutdown_started: AtomicBool,
    tracker: TaskTracker,
    context: Arc<SessionContext>,
}

/// The accept loop, the live-session registry and the shutdown coordination.
///
/// Cheap to clone; all clones drive the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Binds the listening socket.
    ///
    /// Binding happens here, before any accept loop exists, so an unusable port is
    /// reported before the server claims to be running. `shutdown` is the token
    /// that will stop the server; cancelling it from a signal handler is enough.
    pub async fn bind(
        config: ServerConfig,
        executor: Arc<dyn CommandExecutor>,
        shutdown: CancellationToken,
    ) -> Result<Self, ServerError> {
        let addr = config.socket_addr();
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            if source.kind() == io::ErrorKind::AddrInUse {
                ServerError::AddrInUse { addr }
            } else {
                ServerError::Bind { addr, source }
            }
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let running_user = match config.profile() {
            Profile::Shell => exec::running_user(executor.as_ref()).await,
            Profile::Execute { .. } => String::new(),
        };

        let registry = SessionRegistry::new();
        let context = Arc::new(SessionContext {
            profile: config.profile().clone(),
            framing: config.framing(),
            executor,
            running_user,
            registry: registry.clone(),
        });

        info!(
            "Listening on {} ({} profile, {} framing)",
            local_addr,
            config.profile(),
            config.framing()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                local_addr,
                listener: Mutex::new(Some(listener)),
                registry,
                shutdown,
                shutdown_started: AtomicBool::new(false),
                tracker: TaskTracker::new(),
                context,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Runs the accept loop until the shutdown token is cancelled.
    ///
    /// On the way out it performs [`Server::shutdown`] and closes the listener.
    /// Sessions may still be finishing when this returns; use [`Server::wait`].
    pub async fn run(&self) {
        let Some(listener) = self.inner.listener.lock().await.take() else {
            warn!("Accept loop not started: server already shut down or running");
            return;
        };

        loop {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer).await,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        self.shutdown().await;
        drop(listener);
        info!("Server terminated");
    }

    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let (session, entry) = match Session::accept(stream, peer, &self.inner.shutdown) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Dropping connection from {}: {}", peer, e);
                return;
            }
        };

        let id = session.id();
        if let Err(e) = self.inner.registry.add(entry).await {
            // Dropping the session closes the socket.
            warn!("Rejecting {}: {}", peer, e);
            return;
        }

        info!(
            "{} connected ({}, {} live)",
            peer,
            id,
            self.inner.registry.len()
        );
        let context = self.inner.context.clone();
        self.inner.tracker.spawn(session.run(context));
    }

    /// Stops the server. Safe to call any number of times from any task.
    ///
    /// Cancels the shutdown token, closes every live session and releases the
    /// listener if the accept loop never took it. Spawned session tasks are not
    /// awaited here; call [`Server::wait`] for that.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if self.inner.shutdown_started.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Shutting down");
        self.inner.registry.close_all().await;
        drop(self.inner.listener.lock().await.take());
        self.inner.tracker.close();
    }

    /// Waits until every spawned session task has finished.
    pub async fn wait(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Number of session tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.inner.tracker.len()
    }
}

/// Binds, serves until `shutdown` is cancelled, and waits for every session.
pub async fn run_server(
    config: ServerConfig,
    executor: Arc<dyn CommandExecutor>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let server = Server::bind(config, executor, shutdown).await?;
    server.run().await;
    server.wait().await;
    info!("All sessions finished");
    Ok(())
}
