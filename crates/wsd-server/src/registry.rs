//! ConnectionRegistry — the set of currently open connections.

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};
use wsd_protocol::{ConnectionId, DispatchError};
use wsd_transport::Connection;

/// Outcome of a broadcast. Per-connection failures are recorded, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Send attempts made (one per registered connection at snapshot time).
    pub attempted: usize,
    /// Sends that were queued successfully.
    pub delivered: usize,
    /// Connections whose send failed.
    pub failed: Vec<ConnectionId>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Tracks open connections by identity.
///
/// Mutations are per-key exclusive; broadcast works on a snapshot so a
/// concurrent unregister can neither crash it nor cause a double send.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Registering the same connection twice is a caller
    /// error; the second call replaces the first entry.
    pub fn register(&self, conn: Connection) {
        let id = conn.id();
        if self.connections.insert(id, conn).is_some() {
            warn!("Connection {id} registered twice");
        }
    }

    /// Remove a connection, failing if it is not registered.
    pub fn unregister(&self, id: &ConnectionId) -> Result<Connection, DispatchError> {
        self.connections
            .remove(id)
            .map(|(_, conn)| conn)
            .ok_or(DispatchError::NotRegistered(*id))
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Copy of the current membership.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.connections.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Send `message` to every registered connection.
    pub fn broadcast(&self, message: &str) -> BroadcastReport {
        let targets = self.snapshot();
        debug!("Broadcasting to {} clients", targets.len());

        let mut report = BroadcastReport {
            attempted: targets.len(),
            ..BroadcastReport::default()
        };
        for conn in &targets {
            match conn.send(message) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Broadcast to {} failed: {e}", conn.id());
                    report.failed.push(conn.id());
                }
            }
        }
        report
    }
}
