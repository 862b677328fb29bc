//! Live-session bookkeeping for the server.
//!
//! Every accepted connection is entered here before its task starts and taken
//! out exactly once when it ends, either by the session itself or by
//! [`SessionRegistry::close_all`] during shutdown. Whoever takes the entry out
//! owns closing its connection.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("server is shutting down; session {0} not registered")]
    Closing(Uuid),
    #[error("session {0} is already registered")]
    Duplicate(Uuid),
}

/// A second handle on an accepted socket, used to close it from outside the
/// task that is reading from it.
///
/// Closing is a socket-level `shutdown(Both)`: the owning task's pending read
/// returns immediately and the peer sees EOF. Only the first call does anything.
#[derive(Debug)]
pub struct ConnectionHandle {
    socket: TcpStream,
    closed: AtomicBool,
}

impl ConnectionHandle {
    pub fn new(socket: TcpStream) -> Self {
        Self {
            socket,
            closed: AtomicBool::new(false),
        }
    }

    /// Shuts the connection down. Returns `Ok(false)` if it was already closed.
    pub fn close(&self) -> io::Result<bool> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        match self.socket.shutdown(Shutdown::Both) {
            Ok(()) => Ok(true),
            // The peer got there first.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(true),
            Err(e) => Err(e),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// What the registry knows about one live session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub handle: Arc<ConnectionHandle>,
    /// Cancelled when the session is closed from outside.
    pub cancel: CancellationToken,
}

impl SessionEntry {
    fn close(&self) {
        self.cancel.cancel();
        match self.handle.close() {
            Ok(_) => {}
            Err(e) => warn!("Failed to close connection {} ({}): {}", self.peer, self.id, e),
        }
    }
}

/// Concurrent table of live sessions keyed by session id.
///
/// `add` holds the shared side of the `closing` gate while inserting and
/// `close_all` holds the exclusive side while draining, so no session can be
/// added after (or during) a `close_all`.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, SessionEntry>>,
    closing: Arc<RwLock<bool>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, entry: SessionEntry) -> Result<(), RegistryError> {
        let closing = self.closing.read().await;
        if *closing {
            return Err(RegistryError::Closing(entry.id));
        }
        if self.sessions.contains_key(&entry.id) {
            return Err(RegistryError::Duplicate(entry.id));
        }
        self.sessions.insert(entry.id, entry);
        Ok(())
    }

    /// Takes a session out and closes its connection.
    ///
    /// Returns `false` if it was not registered, which happens when `close_all`
    /// already dealt with it. Calling this twice for the same id is harmless.
    pub fn remove(&self, id: Uuid) -> bool {
        match self.sessions.remove(&id) {
            Some((_, entry)) => {
                entry.close();
                true
            }
            None => false,
        }
    }

    /// Closes every tracked connection, empties the table and refuses any
    /// further `add`. Returns how many sessions were closed.
    pub async fn close_all(&self) -> usize {
        let mut closing = self.closing.write().await;
        *closing = true;

        let ids: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;
        for id in ids {
            // A session that finished on its own in the meantime already closed itself.
            if let Some((_, entry)) = self.sessions.remove(&id) {
                entry.close();
                closed += 1;
            }
        }

        if closed > 0 {
            info!("Closed {} live session(s)", closed);
        }
        closed
    }

    pub async fn is_closing(&self) -> bool {
        *self.closing.read().await
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remote addresses of the sessions currently being served.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.sessions.iter().map(|entry| entry.peer).collect()
    }
}
