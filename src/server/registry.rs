//! Active connection tracking.
//!
//! Every accepted socket is registered before its SSH handshake is driven and
//! deregistered by a [`Registration`] guard when the connection task ends, so
//! an aborted task can never leak an entry. Readers get a copy of the current
//! set; shutdown iterates that copy while connections remove themselves.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use russh::Disconnect;
use russh::server::Handle;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::server::error::{Error, Result};

/// How long a failed disconnect waits for the session to finish on its own.
const FINISH_GRACE: Duration = Duration::from_secs(1);

/// Sends the SSH disconnect for one connection.
#[async_trait]
pub trait SessionCloser: Send + Sync {
    async fn disconnect(&self) -> std::result::Result<(), russh::Error>;
}

#[async_trait]
impl SessionCloser for Handle {
    async fn disconnect(&self) -> std::result::Result<(), russh::Error> {
        Handle::disconnect(
            self,
            Disconnect::ByApplication,
            "server shutting down".to_string(),
            "en".to_string(),
        )
        .await
    }
}

/// Unique identifier of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Live handle on one registered connection.
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    connected_at: String,
    username: OnceLock<String>,
    session: OnceLock<Arc<dyn SessionCloser>>,
    close_token: CancellationToken,
    finished: CancellationToken,
}

impl ConnectionHandle {
    /// `close_token` is cancelled when the connection must go away; pass a
    /// child of the run's stop token.
    pub fn new(peer: SocketAddr, close_token: CancellationToken) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            connected_at: chrono::Utc::now().to_rfc3339(),
            username: OnceLock::new(),
            session: OnceLock::new(),
            close_token,
            finished: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    /// Record the authenticated username. Only the first call has an effect.
    pub(crate) fn set_username(&self, username: &str) {
        let _ = self.username.set(username.to_string());
    }

    /// Attach the russh session handle once the handshake has started.
    pub(crate) fn attach(&self, handle: Handle) {
        self.attach_closer(Arc::new(handle));
    }

    /// Attach what [`close`](Self::close) uses to disconnect the session.
    /// Only the first call has an effect.
    pub(crate) fn attach_closer(&self, closer: Arc<dyn SessionCloser>) {
        let _ = self.session.set(closer);
    }

    /// Token cancelled when this connection is asked to close.
    pub fn close_token(&self) -> &CancellationToken {
        &self.close_token
    }

    pub fn is_closing(&self) -> bool {
        self.close_token.is_cancelled()
    }

    /// Mark the SSH session as ended.
    pub(crate) fn mark_finished(&self) {
        self.finished.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Close the connection.
    ///
    /// The close token is always cancelled; if the SSH session is already
    /// up the client is also sent a disconnect message. A session that ends
    /// by itself while the disconnect is in flight counts as closed.
    pub async fn close(&self) -> Result<()> {
        self.close_token.cancel();
        let Some(closer) = self.session.get() else {
            return Ok(());
        };
        if self.is_finished() {
            return Ok(());
        }

        match closer.disconnect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if tokio::time::timeout(FINISH_GRACE, self.finished.cancelled())
                    .await
                    .is_ok()
                {
                    debug!(connection_id = %self.id, "Session ended during disconnect");
                    return Ok(());
                }
                Err(Error::Teardown {
                    connection: self.id.to_string(),
                    reason: format!("{e:?}"),
                })
            }
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            remote_addr: self.peer.ip().to_string(),
            remote_port: self.peer.port(),
            username: self.username().map(str::to_string),
            connected_at: self.connected_at.clone(),
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("username", &self.username())
            .field("closing", &self.is_closing())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Point-in-time description of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub remote_addr: String,
    pub remote_port: u16,
    pub username: Option<String>,
    pub connected_at: String,
}

/// Set of active connections, unique by [`ConnectionId`].
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<ConnectionHandle>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection. The returned guard removes it again on drop.
    pub fn register(self: &Arc<Self>, handle: Arc<ConnectionHandle>) -> Registration {
        let id = handle.id();
        let count = {
            let mut connections = self.lock();
            connections.insert(id, handle);
            connections.len()
        };
        debug!(connection_id = %id, "Registered connection ({} active)", count);
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Remove a connection, returning it if it was registered.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.lock().remove(&id);
        if removed.is_some() {
            debug!(connection_id = %id, "Unregistered connection");
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.lock().get(&id).cloned()
    }

    /// Copy of the current set.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Close every registered connection.
    ///
    /// All closes are attempted; the first failure is returned once they have
    /// all completed.
    pub async fn close_all(&self) -> Result<()> {
        let connections = self.snapshot();
        if connections.is_empty() {
            return Ok(());
        }
        debug!("Closing {} connection(s)", connections.len());

        let results =
            futures::future::join_all(connections.iter().map(|connection| connection.close()))
                .await;
        results.into_iter().find_map(|r| r.err()).map_or(Ok(()), Err)
    }
}

/// Keeps a connection registered for as long as it is alive.
#[must_use = "dropping the registration unregisters the connection"]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
