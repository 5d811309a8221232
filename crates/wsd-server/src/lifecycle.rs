//! ConnectionLifecycle — drives one connection from accept to close.
//!
//! `Open → Active` pushes a context frame, registers the connection,
//! associates its correlation token, and runs the open handlers.
//! `Active → Active` dispatches each inbound message.
//! `Active → Closing → Closed` runs the close handlers, unregisters,
//! dissociates, and pops the context frame. Every cleanup step runs even
//! when an earlier one fails, a handler panics, or the task is cancelled.

use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, warn};
use wsd_protocol::{DispatchError, MatchMode};
use wsd_transport::{Connection, ConnectionState, InboundStream};

use crate::context::{self, ContextGuard};
use crate::correlation::CorrelationIndex;
use crate::handlers::{HandlerRegistry, call_handler};
use crate::registry::ConnectionRegistry;
use crate::router::{DispatchEngine, DispatchOutcome};

pub struct ConnectionLifecycle {
    connections: Arc<ConnectionRegistry>,
    correlation: Arc<CorrelationIndex>,
    handlers: Arc<HandlerRegistry>,
    engine: DispatchEngine,
}

impl ConnectionLifecycle {
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        correlation: Arc<CorrelationIndex>,
        handlers: Arc<HandlerRegistry>,
        mode: MatchMode,
    ) -> Self {
        let engine = DispatchEngine::new(handlers.clone(), mode);
        Self {
            connections,
            correlation,
            handlers,
            engine,
        }
    }

    /// Serve `conn` until `inbound` ends, fails, or a handler fails.
    pub async fn run(&self, conn: Connection, mut inbound: InboundStream) {
        context::ensure_scope(async {
            let guard = match ContextGuard::enter(conn.clone()) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    warn!("No context frame for {}: {e}", conn.id());
                    None
                }
            };

            // Declared after the context guard so it drops first: cleanup
            // runs inside the connection context, also on cancellation.
            let cleanup = CloseOnDrop { lifecycle: self, conn: &conn };

            if self.open(&conn).is_ok() {
                self.pump(&conn, &mut inbound).await;
            }

            drop(cleanup);
            drop(guard);
        })
        .await
    }

    /// Register the connection and run the open handlers in order.
    /// The first failing open handler stops the rest.
    pub fn open(&self, conn: &Connection) -> Result<(), DispatchError> {
        debug!("WebSocket client connected: {}", conn.id());
        self.connections.register(conn.clone());
        if let Some(token) = conn.token() {
            self.correlation.associate(token.clone(), conn.clone());
        }

        for handler in self.handlers.open_handlers() {
            if let Err(e) = call_handler(|| handler(conn)) {
                warn!("Open handler failed for {}: {e}", conn.id());
                return Err(DispatchError::Handler(e));
            }
        }
        conn.set_state(ConnectionState::Active);
        Ok(())
    }

    /// Dispatch one inbound message. An error means the connection should close.
    pub fn message(
        &self,
        conn: &Connection,
        message: Option<&str>,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.engine.dispatch(conn, message)
    }

    /// Run close handlers, unregister, and dissociate. Best effort: failures
    /// are logged and the remaining steps still run.
    pub fn close(&self, conn: &Connection) {
        debug!("WebSocket client disconnected: {}", conn.id());
        conn.set_state(ConnectionState::Closing);

        for handler in self.handlers.close_handlers() {
            if let Err(e) = call_handler(|| handler(conn)) {
                warn!("Close handler failed for {}: {e}", conn.id());
            }
        }
        if let Err(e) = self.connections.unregister(&conn.id()) {
            warn!("Cleanup: {e}");
        }
        self.correlation.dissociate(&conn.id());
        conn.close();
    }

    async fn pump(&self, conn: &Connection, inbound: &mut InboundStream) {
        while let Some(item) = inbound.next().await {
            let message = match item {
                Ok(message) => message,
                Err(e) => {
                    debug!("Transport ended for {}: {e}", conn.id());
                    break;
                }
            };
            if let Err(e) = self.message(conn, message.as_deref()) {
                warn!("Dispatch failed on {}, closing: {e}", conn.id());
                break;
            }
        }
    }
}

/// Runs [`ConnectionLifecycle::close`] when dropped.
struct CloseOnDrop<'a> {
    lifecycle: &'a ConnectionLifecycle,
    conn: &'a Connection,
}

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        self.lifecycle.close(self.conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use parking_lot::Mutex;
    use wsd_protocol::{Outbound, PatternFlags};
    use wsd_transport::{Handshake, TransportError};

    type Events = Arc<Mutex<Vec<String>>>;

    struct Fixture {
        connections: Arc<ConnectionRegistry>,
        correlation: Arc<CorrelationIndex>,
        lifecycle: ConnectionLifecycle,
    }

    fn fixture(handlers: HandlerRegistry) -> Fixture {
        let connections = Arc::new(ConnectionRegistry::new());
        let correlation = Arc::new(CorrelationIndex::new());
        let lifecycle = ConnectionLifecycle::new(
            connections.clone(),
            correlation.clone(),
            Arc::new(handlers),
            MatchMode::All,
        );
        Fixture { connections, correlation, lifecycle }
    }

    fn inbound(items: Vec<Result<Option<String>, TransportError>>) -> InboundStream {
        stream::iter(items).boxed()
    }

    fn text(s: &str) -> Result<Option<String>, TransportError> {
        Ok(Some(s.to_string()))
    }

    fn boom() -> wsd_protocol::HandlerError {
        "boom".into()
    }

    #[tokio::test]
    async fn open_handlers_run_inside_the_connection_context() {
        let events = Events::default();
        let mut handlers = HandlerRegistry::new();
        let e = events.clone();
        handlers.register_open(move |conn| {
            let current = context::current()?;
            e.lock().push(format!("open same={}", current == *conn));
            Ok(())
        });
        let f = fixture(handlers);
        let (conn, _rx) = Connection::pair(Handshake::new("/").with_token("u1"));

        f.lifecycle.run(conn.clone(), inbound(vec![])).await;
        assert_eq!(*events.lock(), vec!["open same=true"]);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn full_lifecycle_updates_registries() {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register_pattern("^Ping$", PatternFlags::default(), |_, _| Ok(Some("Pong".into())))
            .unwrap();
        let f = fixture(handlers);
        let (conn, mut rx) = Connection::pair(Handshake::new("/").with_token("u1"));

        f.lifecycle.open(&conn).unwrap();
        assert!(f.connections.contains(&conn.id()));
        assert_eq!(f.correlation.resolve(&"u1".into()), Some(conn.clone()));
        assert_eq!(conn.state(), ConnectionState::Active);

        f.lifecycle.message(&conn, Some("Ping")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Outbound::text("Pong"));

        f.lifecycle.close(&conn);
        assert!(!f.connections.contains(&conn.id()));
        assert!(f.correlation.resolve(&"u1".into()).is_none());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }

    #[tokio::test]
    async fn handler_error_closes_connection_with_close_handlers() {
        let events = Events::default();
        let mut handlers = HandlerRegistry::new();
        let e = events.clone();
        handlers.register_message(move |_, msg| {
            e.lock().push(format!("msg {msg}"));
            if msg == "fail" { Err(boom()) } else { Ok(None) }
        });
        let e = events.clone();
        handlers.register_close(move |_| {
            e.lock().push("close".into());
            Ok(())
        });
        let f = fixture(handlers);
        let (conn, _rx) = Connection::pair(Handshake::new("/"));

        f.lifecycle
            .run(conn.clone(), inbound(vec![text("a"), text("fail"), text("never")]))
            .await;

        assert_eq!(*events.lock(), vec!["msg a", "msg fail", "close"]);
        assert!(f.connections.is_empty());
    }

    #[tokio::test]
    async fn failing_open_handler_skips_messages_but_cleans_up() {
        let events = Events::default();
        let mut handlers = HandlerRegistry::new();
        handlers.register_open(|_| Err(boom()));
        let e = events.clone();
        handlers.register_open(move |_| {
            e.lock().push("second open".into());
            Ok(())
        });
        let e = events.clone();
        handlers.register_message(move |_, _| {
            e.lock().push("msg".into());
            Ok(None)
        });
        let e = events.clone();
        handlers.register_close(move |_| {
            e.lock().push("close".into());
            Ok(())
        });
        let f = fixture(handlers);
        let (conn, _rx) = Connection::pair(Handshake::new("/").with_token("t"));

        f.lifecycle.run(conn, inbound(vec![text("hello")])).await;

        assert_eq!(*events.lock(), vec!["close"]);
        assert!(f.connections.is_empty());
        assert!(f.correlation.is_empty());
    }

    #[tokio::test]
    async fn failing_close_handler_does_not_stop_cleanup() {
        let events = Events::default();
        let mut handlers = HandlerRegistry::new();
        handlers.register_close(|_| Err(boom()));
        let e = events.clone();
        handlers.register_close(move |_| {
            e.lock().push("second close".into());
            Ok(())
        });
        let f = fixture(handlers);
        let (conn, _rx) = Connection::pair(Handshake::new("/").with_token("t"));

        f.lifecycle.run(conn, inbound(vec![text("x"), Ok(None)])).await;

        assert_eq!(*events.lock(), vec!["second close"]);
        assert!(f.connections.is_empty());
        assert!(f.correlation.is_empty());
    }

    #[tokio::test]
    async fn context_is_popped_after_run() {
        let f = fixture(HandlerRegistry::new());
        let (conn, _rx) = Connection::pair(Handshake::new("/"));
        context::scope(async {
            f.lifecycle.run(conn, inbound(vec![text("x")])).await;
            assert!(!context::has_context());
        })
        .await;
    }

    #[tokio::test]
    async fn panicking_message_handler_still_cleans_up() {
        let events = Events::default();
        let mut handlers = HandlerRegistry::new();
        handlers.register_message(|_, msg| {
            if msg == "crash" {
                panic!("user bug");
            }
            Ok(None)
        });
        let e = events.clone();
        handlers.register_close(move |_| {
            e.lock().push("close".into());
            Ok(())
        });
        let f = fixture(handlers);
        let (conn, mut rx) = Connection::pair(Handshake::new("/").with_token("u1"));

        f.lifecycle
            .run(conn.clone(), inbound(vec![text("crash"), text("never")]))
            .await;

        assert_eq!(*events.lock(), vec!["close"]);
        assert!(f.connections.is_empty());
        assert!(f.correlation.resolve(&"u1".into()).is_none());
        assert_eq!(f.connections.broadcast("late").attempted, 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }

    #[tokio::test]
    async fn panicking_open_and_close_handlers_do_not_skip_cleanup() {
        let events = Events::default();
        let mut handlers = HandlerRegistry::new();
        handlers.register_open(|_| panic!("open bug"));
        handlers.register_close(|_| panic!("close bug"));
        let e = events.clone();
        handlers.register_close(move |_| {
            e.lock().push("second close".into());
            Ok(())
        });
        let f = fixture(handlers);
        let (conn, _rx) = Connection::pair(Handshake::new("/").with_token("u1"));

        f.lifecycle.run(conn, inbound(vec![text("x")])).await;

        assert_eq!(*events.lock(), vec!["second close"]);
        assert!(f.connections.is_empty());
        assert!(f.correlation.is_empty());
    }

    #[tokio::test]
    async fn cancelled_run_still_cleans_up() {
        let events = Events::default();
        let mut handlers = HandlerRegistry::new();
        let e = events.clone();
        handlers.register_close(move |_| {
            e.lock().push("close".into());
            Ok(())
        });
        let Fixture { connections, correlation, lifecycle } = fixture(handlers);
        let (conn, _rx) = Connection::pair(Handshake::new("/").with_token("u1"));

        let pending: InboundStream = stream::pending().boxed();
        let task = tokio::spawn(async move { lifecycle.run(conn, pending).await });
        while connections.is_empty() {
            tokio::task::yield_now().await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(*events.lock(), vec!["close"]);
        assert!(connections.is_empty());
        assert!(correlation.is_empty());
    }
}
