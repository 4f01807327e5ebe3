//! Connection Registry
//!
//! The authoritative set of open connections. A single mutex guards
//! membership; it is held only for inserts, removals and snapshots, never
//! across a transport write.
//!
//! A slot can be reserved for a connection that is still handshaking: it
//! counts against the limit, but the dispatcher skips it until it is `Open`.
//! Once drained for shutdown the registry refuses new members.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::connection::{Connection, ConnectionId};
use super::error::RegistryError;

/// Live connections keyed by id
pub struct Registry {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    max_connections: usize,
    /// Set by `drain`; only written with `connections` locked
    closed: AtomicBool,
}

impl Registry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            max_connections,
            closed: AtomicBool::new(false),
        }
    }

    /// Insert a connection and move it to `Open`
    ///
    /// Fails if the registry is shut down, the limit is reached or the id is
    /// already present.
    pub async fn register(
        &self,
        connection: Arc<Connection>,
    ) -> Result<ConnectionId, RegistryError> {
        let id = self.reserve(Arc::clone(&connection)).await?;
        if !connection.mark_open() {
            self.release(id).await;
            return Err(RegistryError::ShuttingDown);
        }

        tracing::info!(connection_id = %id, "WebSocket connected");
        Ok(id)
    }

    /// Claim a slot for a connection without opening it
    ///
    /// The connection keeps its current state, so broadcasts skip it until
    /// the caller marks it `Open`.
    pub async fn reserve(
        &self,
        connection: Arc<Connection>,
    ) -> Result<ConnectionId, RegistryError> {
        let id = connection.id();
        let mut connections = self.connections.lock().await;

        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::ShuttingDown);
        }
        if connections.len() >= self.max_connections {
            return Err(RegistryError::TooManyConnections(self.max_connections));
        }
        if connections.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }

        connections.insert(id, connection);
        Ok(id)
    }

    /// Remove a connection; absent ids are a no-op
    pub async fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.lock().await.remove(&id);

        if removed.is_some() {
            tracing::info!(connection_id = %id, "WebSocket disconnected");
        }
        removed
    }

    /// Give back a reserved slot whose handshake did not complete
    pub async fn release(&self, id: ConnectionId) {
        self.connections.lock().await.remove(&id);
    }

    /// Consistent copy of the current membership
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().await.values().cloned().collect()
    }

    /// Drop every listed connection in one critical section
    ///
    /// Returns how many were actually removed.
    pub async fn compact(&self, failed: &[ConnectionId]) -> usize {
        let mut pruned = Vec::new();
        let mut connections = self.connections.lock().await;
        connections.retain(|id, _| {
            let keep = !failed.contains(id);
            if !keep {
                pruned.push(*id);
            }
            keep
        });
        drop(connections);

        for id in &pruned {
            tracing::warn!(connection_id = %id, "Pruned dead connection");
        }
        pruned.len()
    }

    /// Empty the registry for shutdown, handing back everything in it
    ///
    /// Later `register` and `reserve` calls fail with `ShuttingDown`.
    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        let mut connections = self.connections.lock().await;
        self.closed.store(true, Ordering::Release);
        connections.drain().map(|(_, connection)| connection).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether another connection would currently be accepted
    pub async fn has_capacity(&self) -> bool {
        self.len().await < self.max_connections
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}
