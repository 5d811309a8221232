//! Connection handles shared between the transport and the dispatch core.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;
use wsd_protocol::{ConnectionId, CorrelationToken, Outbound, SendError};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake accepted, open handlers not yet finished.
    Open,
    /// Receiving and dispatching messages.
    Active,
    /// Termination signaled; close handlers and cleanup running.
    Closing,
    /// Terminal.
    Closed,
}

/// Metadata captured when the connection's handshake was accepted.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Request path the upgrade arrived on.
    pub path: String,
    /// Correlation token read from the handshake's cookie header, if any.
    pub token: Option<CorrelationToken>,
    /// When the handshake was accepted.
    pub connected_at: DateTime<Utc>,
}

impl Handshake {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            token: None,
            connected_at: Utc::now(),
        }
    }

    pub fn with_token(mut self, token: impl Into<CorrelationToken>) -> Self {
        self.token = Some(token.into());
        self
    }
}

struct ConnectionInner {
    id: ConnectionId,
    handshake: Handshake,
    state: RwLock<ConnectionState>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// A cheap, cloneable handle to one live connection.
///
/// The transport owns the socket; handles only queue frames for the
/// connection's writer. Two handles are equal when they refer to the same
/// connection id.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a handle and the receiver its writer drains.
    pub fn pair(handshake: Handshake) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::new(),
                handshake,
                state: RwLock::new(ConnectionState::Open),
                outbound,
            }),
        };
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn handshake(&self) -> &Handshake {
        &self.inner.handshake
    }

    pub fn token(&self) -> Option<&CorrelationToken> {
        self.inner.handshake.token.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Whether sends are still accepted (state `Open` or `Active`).
    pub fn is_open(&self) -> bool {
        matches!(self.state(), ConnectionState::Open | ConnectionState::Active)
    }

    pub fn set_state(&self, next: ConnectionState) {
        let mut state = self.inner.state.write();
        if *state != next {
            debug!("Connection {} state {:?} -> {:?}", self.inner.id, *state, next);
            *state = next;
        }
    }

    /// Queue a text message for the peer.
    pub fn send(&self, message: impl Into<String>) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed(self.inner.id));
        }
        self.inner
            .outbound
            .send(Outbound::Text(message.into()))
            .map_err(|_| SendError::Closed(self.inner.id))
    }

    /// Mark the connection closed and ask the writer to send a close frame.
    /// Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.write();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        // The writer may already be gone.
        let _ = self.inner.outbound.send(Outbound::Close);
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("token", &self.inner.handshake.token)
            .finish()
    }
}
