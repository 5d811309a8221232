//! SocketHub — the top-level coordinator.
//!
//! Owns the handler registry, the connection registry, and the correlation
//! index, and implements the transport's [`SocketHandler`] seam. Handlers
//! are registered on a mutable hub before it is shared; the hub is then
//! wrapped in an `Arc` and handed to the transport.

use std::future::Future;
use std::sync::Arc;

use tracing::info;
use wsd_protocol::{CorrelationToken, DispatchError, HandlerError, MatchMode, PatternFlags};
use wsd_transport::{Connection, InboundStream, SocketHandler};

use crate::bridge::CrossChannelBridge;
use crate::context;
use crate::correlation::CorrelationIndex;
use crate::handlers::{HandlerRegistry, MessageResult};
use crate::lifecycle::ConnectionLifecycle;
use crate::registry::{BroadcastReport, ConnectionRegistry};

/// Dispatch configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Whether the first matching handler ends dispatch
    pub mode: MatchMode,
}

impl DispatchConfig {
    pub fn match_one() -> Self {
        Self { mode: MatchMode::One }
    }
}

pub struct SocketHub {
    config: DispatchConfig,
    handlers: Arc<HandlerRegistry>,
    connections: Arc<ConnectionRegistry>,
    correlation: Arc<CorrelationIndex>,
}

impl SocketHub {
    pub fn new(config: DispatchConfig) -> Self {
        info!("Using wsdispatch version {}", wsd_protocol::VERSION);
        Self {
            config,
            handlers: Arc::new(HandlerRegistry::new()),
            connections: Arc::new(ConnectionRegistry::new()),
            correlation: Arc::new(CorrelationIndex::new()),
        }
    }

    // ── Registration ──────────────────────────────────────────────────────

    pub fn on_open<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Connection) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.handlers).register_open(handler);
        self
    }

    pub fn on_close<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Connection) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.handlers).register_close(handler);
        self
    }

    /// Register a catch-all message handler.
    pub fn on_message<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Connection, &str) -> MessageResult + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.handlers).register_message(handler);
        self
    }

    /// Register a handler for messages starting with a match for `pattern`.
    pub fn on_pattern<F>(
        &mut self,
        pattern: &str,
        flags: PatternFlags,
        handler: F,
    ) -> Result<&mut Self, DispatchError>
    where
        F: Fn(&Connection, &str) -> MessageResult + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.handlers).register_pattern(pattern, flags, handler)?;
        Ok(self)
    }

    // ── Sending ───────────────────────────────────────────────────────────

    /// Send `message` to every open connection.
    pub fn broadcast(&self, message: &str) -> BroadcastReport {
        self.connections.broadcast(message)
    }

    /// Send on whichever connection is current for this task.
    pub fn send_to_current(&self, message: impl Into<String>) -> Result<(), DispatchError> {
        context::send_to_current(message)
    }

    pub fn current(&self) -> Result<Connection, DispatchError> {
        context::current()
    }

    pub fn has_context(&self) -> bool {
        context::has_context()
    }

    // ── Components ────────────────────────────────────────────────────────

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn correlation(&self) -> &CorrelationIndex {
        &self.correlation
    }

    pub fn resolve_token(&self, token: &CorrelationToken) -> Option<Connection> {
        self.bridge().resolve(Some(token))
    }

    pub fn bridge(&self) -> CrossChannelBridge {
        CrossChannelBridge::new(self.correlation.clone())
    }

    pub fn lifecycle(&self) -> ConnectionLifecycle {
        ConnectionLifecycle::new(
            self.connections.clone(),
            self.correlation.clone(),
            self.handlers.clone(),
            self.config.mode,
        )
    }
}

impl Default for SocketHub {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

impl SocketHandler for SocketHub {
    async fn serve_connection(&self, conn: Connection, inbound: InboundStream) {
        self.lifecycle().run(conn, inbound).await
    }

    async fn bridge_request<F>(&self, token: Option<CorrelationToken>, request: F) -> F::Output
    where
        F: Future + Send,
        F::Output: Send,
    {
        self.bridge().scope(token.as_ref(), request).await
    }
}
