//! Connection registries
//!
//! A registry maps session ids to [`Connection`]s. Chat clients use
//! [`MultiSessionRegistry`] (one connection per session id), workflow runs
//! use [`SingleConnectionRegistry`] (one connection, the id is ignored).

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{ConnectFuture, Connection, ConnectionState, ready_future};
use crate::error::{ChatFlowError, Result};
use crate::transport::Connector;
use crate::types::config::ClientConfig;
use crate::types::identifiers::SessionId;

/// Grace period granted to connection tasks on shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Session-id keyed access to connections
pub trait ConnectionRegistry: Send + Sync {
    /// Connection for `id`, created on first use
    ///
    /// # Errors
    /// Returns `SessionError` once the registry has been shut down
    fn get(&self, id: &SessionId) -> Result<Connection>;

    /// Connection for `id` if one exists
    fn lookup(&self, id: &SessionId) -> Option<Connection>;

    /// State of the connection for `id`, `NotExist` if there is none
    fn state(&self, id: &SessionId) -> ConnectionState {
        self.lookup(id)
            .map_or(ConnectionState::NotExist, |c| c.state())
    }

    /// Whether the connection for `id` is established
    fn is_connected(&self, id: &SessionId) -> bool {
        self.state(id) == ConnectionState::Connected
    }

    /// Connect the connection for `id`, creating it if needed
    fn connect(&self, id: &SessionId) -> ConnectFuture {
        match self.get(id) {
            Ok(connection) => connection.connect(),
            Err(err) => ready_future(Err(err)),
        }
    }

    /// Close and forget the connection for `id`
    fn disconnect(&self, id: &SessionId);

    /// Close every connection and refuse new ones, waiting up to `grace`
    /// for connection tasks to stop
    fn shutdown(&self, grace: Duration) -> BoxFuture<'_, ()>;
}

fn closed_registry() -> ChatFlowError {
    ChatFlowError::session("connection registry has been shut down")
}

async fn shutdown_all(connections: Vec<Connection>, grace: Duration) {
    futures::future::join_all(connections.iter().map(|c| c.shutdown(grace))).await;
}

// ============================================================================
// Multi-session
// ============================================================================

#[derive(Default)]
struct Sessions {
    connections: HashMap<SessionId, Connection>,
    shut_down: bool,
}

/// One connection per distinct session id
pub struct MultiSessionRegistry {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    sessions: Mutex<Sessions>,
}

impl MultiSessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: Arc<ClientConfig>, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            sessions: Mutex::new(Sessions::default()),
        }
    }

    /// Ids with a live connection entry
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.lock().connections.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl ConnectionRegistry for MultiSessionRegistry {
    fn get(&self, id: &SessionId) -> Result<Connection> {
        let mut sessions = self.sessions.lock();
        if sessions.shut_down {
            return Err(closed_registry());
        }
        // A closed entry is replaced so a disconnected session can be reused
        if let Some(existing) = sessions.connections.get(id)
            && existing.state() != ConnectionState::Closed
        {
            return Ok(existing.clone());
        }
        log::debug!("[{id}] creating connection");
        let connection = Connection::new(id.clone(), Arc::clone(&self.config), Arc::clone(&self.connector));
        sessions.connections.insert(id.clone(), connection.clone());
        Ok(connection)
    }

    fn lookup(&self, id: &SessionId) -> Option<Connection> {
        self.sessions.lock().connections.get(id).cloned()
    }

    fn disconnect(&self, id: &SessionId) {
        let removed = self.sessions.lock().connections.remove(id);
        if let Some(connection) = removed {
            connection.close();
        }
    }

    fn shutdown(&self, grace: Duration) -> BoxFuture<'_, ()> {
        let connections: Vec<Connection> = {
            let mut sessions = self.sessions.lock();
            sessions.shut_down = true;
            sessions.connections.drain().map(|(_, c)| c).collect()
        };
        log::debug!("shutting down {} connection(s)", connections.len());
        shutdown_all(connections, grace).boxed()
    }
}

// ============================================================================
// Single connection
// ============================================================================

#[derive(Default)]
struct Single {
    connection: Option<Connection>,
    shut_down: bool,
}

/// Exactly one connection, whatever id is asked for
///
/// The connection is created lazily under the id of the first request.
pub struct SingleConnectionRegistry {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    slot: Mutex<Single>,
}

impl SingleConnectionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: Arc<ClientConfig>, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            slot: Mutex::new(Single::default()),
        }
    }
}

impl ConnectionRegistry for SingleConnectionRegistry {
    fn get(&self, id: &SessionId) -> Result<Connection> {
        let mut slot = self.slot.lock();
        if slot.shut_down {
            return Err(closed_registry());
        }
        if let Some(existing) = &slot.connection
            && existing.state() != ConnectionState::Closed
        {
            return Ok(existing.clone());
        }
        let connection = Connection::new(id.clone(), Arc::clone(&self.config), Arc::clone(&self.connector));
        slot.connection = Some(connection.clone());
        Ok(connection)
    }

    fn lookup(&self, _id: &SessionId) -> Option<Connection> {
        self.slot.lock().connection.clone()
    }

    fn disconnect(&self, _id: &SessionId) {
        let removed = self.slot.lock().connection.take();
        if let Some(connection) = removed {
            connection.close();
        }
    }

    fn shutdown(&self, grace: Duration) -> BoxFuture<'_, ()> {
        let connections: Vec<Connection> = {
            let mut slot = self.slot.lock();
            slot.shut_down = true;
            slot.connection.take().into_iter().collect()
        };
        shutdown_all(connections, grace).boxed()
    }
}
