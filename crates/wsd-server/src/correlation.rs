//! CorrelationIndex — correlation token to live connection.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;
use wsd_protocol::{ConnectionId, CorrelationToken};
use wsd_transport::Connection;

/// Maps correlation tokens to the connection that most recently presented
/// them. Removal is by connection identity so a reconnect that reused the
/// token keeps its newer mapping.
#[derive(Default)]
pub struct CorrelationIndex {
    entries: RwLock<HashMap<CorrelationToken, Connection>>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or overwrite the mapping for `token`.
    pub fn associate(&self, token: CorrelationToken, conn: Connection) {
        if let Some(previous) = self.entries.write().insert(token, conn.clone()) {
            if previous != conn {
                debug!("Correlation token moved from {} to {}", previous.id(), conn.id());
            }
        }
    }

    pub fn resolve(&self, token: &CorrelationToken) -> Option<Connection> {
        self.entries.read().get(token).cloned()
    }

    /// Drop whichever entry points at `id`. No-op when there is none.
    pub fn dissociate(&self, id: &ConnectionId) -> Option<CorrelationToken> {
        let mut entries = self.entries.write();
        let token = entries
            .iter()
            .find(|(_, conn)| conn.id() == *id)
            .map(|(token, _)| token.clone())?;
        entries.remove(&token);
        Some(token)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
