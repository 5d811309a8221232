//! DispatchEngine — routes an inbound message to matching handlers.
//!
//! Pattern handlers run first, in registration order, then catch-all
//! handlers. In [`MatchMode::One`] the first pattern match ends dispatch;
//! otherwise the first catch-all does. In [`MatchMode::All`] every matching
//! handler runs and each reply is sent independently.

use std::sync::Arc;

use tracing::debug;
use wsd_protocol::{DispatchError, MatchMode};
use wsd_transport::Connection;

use crate::handlers::{HandlerRegistry, MessageHandler, call_handler};

/// What a single dispatch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers invoked.
    pub invoked: usize,
    /// Replies sent back on the connection.
    pub responses: usize,
}

/// Routes messages using a frozen handler registry.
#[derive(Clone)]
pub struct DispatchEngine {
    handlers: Arc<HandlerRegistry>,
    mode: MatchMode,
}

impl DispatchEngine {
    pub fn new(handlers: Arc<HandlerRegistry>, mode: MatchMode) -> Self {
        Self { handlers, mode }
    }

    /// Dispatch `message` received on `conn`. `None` is the no-data sentinel.
    ///
    /// A handler error aborts dispatch of this message and is returned as
    /// [`DispatchError::Handler`]. A failed reply is [`DispatchError::Send`].
    pub fn dispatch(
        &self,
        conn: &Connection,
        message: Option<&str>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(message) = message else {
            debug!("Empty WebSocket message received, ignoring.");
            return Ok(DispatchOutcome::default());
        };
        debug!("WebSocket message received on {}", conn.id());

        let mut outcome = DispatchOutcome::default();
        if self.dispatch_patterns(conn, message, &mut outcome)? {
            return Ok(outcome);
        }
        self.dispatch_catch_all(conn, message, &mut outcome)?;
        Ok(outcome)
    }

    /// Returns true when dispatch should stop here.
    fn dispatch_patterns(
        &self,
        conn: &Connection,
        message: &str,
        outcome: &mut DispatchOutcome,
    ) -> Result<bool, DispatchError> {
        for entry in self.handlers.pattern_handlers() {
            if !entry.matches(message) {
                continue;
            }
            self.invoke(entry.handler(), conn, message, outcome)?;
            if self.mode.is_match_one() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn dispatch_catch_all(
        &self,
        conn: &Connection,
        message: &str,
        outcome: &mut DispatchOutcome,
    ) -> Result<bool, DispatchError> {
        for handler in self.handlers.catch_all_handlers() {
            self.invoke(handler, conn, message, outcome)?;
            if self.mode.is_match_one() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn invoke(
        &self,
        handler: &MessageHandler,
        conn: &Connection,
        message: &str,
        outcome: &mut DispatchOutcome,
    ) -> Result<(), DispatchError> {
        outcome.invoked += 1;
        let reply = call_handler(|| handler(conn, message)).map_err(DispatchError::Handler)?;
        if let Some(reply) = reply {
            conn.send(reply)?;
            outcome.responses += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use wsd_protocol::{Outbound, PatternFlags};
    use wsd_transport::Handshake;

    type Calls = Arc<Mutex<Vec<&'static str>>>;

    /// "^ECHO " and "^PING$" pattern handlers plus a logging catch-all.
    fn registry(calls: &Calls) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        let c = calls.clone();
        registry
            .register_pattern("^ECHO ", PatternFlags::default(), move |_, msg| {
                c.lock().push("echo");
                Ok(msg.split_once(' ').map(|(_, rest)| rest.to_string()))
            })
            .unwrap();
        let c = calls.clone();
        registry
            .register_pattern("^PING$", PatternFlags::default(), move |_, _| {
                c.lock().push("ping");
                Ok(Some("PONG".into()))
            })
            .unwrap();
        let c = calls.clone();
        registry.register_message(move |_, _| {
            c.lock().push("logger");
            Ok(None)
        });
        Arc::new(registry)
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn match_all_runs_matching_patterns_and_catch_all() {
        let calls = Calls::default();
        let engine = DispatchEngine::new(registry(&calls), MatchMode::All);
        let (conn, mut rx) = Connection::pair(Handshake::new("/"));

        let outcome = engine.dispatch(&conn, Some("ECHO hi")).unwrap();
        assert_eq!(*calls.lock(), vec!["echo", "logger"]);
        assert_eq!(outcome, DispatchOutcome { invoked: 2, responses: 1 });
        assert_eq!(drain(&mut rx), vec![Outbound::text("hi")]);

        calls.lock().clear();
        engine.dispatch(&conn, Some("unmatched")).unwrap();
        assert_eq!(*calls.lock(), vec!["logger"]);
    }

    #[test]
    fn match_one_stops_at_first_pattern() {
        let calls = Calls::default();
        let engine = DispatchEngine::new(registry(&calls), MatchMode::One);
        let (conn, _rx) = Connection::pair(Handshake::new("/"));

        engine.dispatch(&conn, Some("ECHO hi")).unwrap();
        assert_eq!(*calls.lock(), vec!["echo"]);

        calls.lock().clear();
        engine.dispatch(&conn, Some("unmatched")).unwrap();
        assert_eq!(*calls.lock(), vec!["logger"]);
    }

    #[test]
    fn match_one_runs_only_first_catch_all() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_message(|_, _| Ok(Some("first".into())))
            .register_message(|_, _| Ok(Some("second".into())));
        let engine = DispatchEngine::new(Arc::new(registry), MatchMode::One);
        let (conn, mut rx) = Connection::pair(Handshake::new("/"));

        engine.dispatch(&conn, Some("x")).unwrap();
        assert_eq!(drain(&mut rx), vec![Outbound::text("first")]);
    }

    #[test]
    fn end_anchor_in_pattern_is_respected() {
        let calls = Calls::default();
        let engine = DispatchEngine::new(registry(&calls), MatchMode::All);
        let (conn, _rx) = Connection::pair(Handshake::new("/"));

        engine.dispatch(&conn, Some("PING")).unwrap();
        assert_eq!(*calls.lock(), vec!["ping", "logger"]);

        calls.lock().clear();
        engine.dispatch(&conn, Some("PING extra")).unwrap();
        assert_eq!(*calls.lock(), vec!["logger"]);
    }

    #[test]
    fn no_data_sentinel_is_a_no_op() {
        let calls = Calls::default();
        let engine = DispatchEngine::new(registry(&calls), MatchMode::All);
        let (conn, mut rx) = Connection::pair(Handshake::new("/"));

        let outcome = engine.dispatch(&conn, None).unwrap();
        assert_eq!(outcome, DispatchOutcome::default());
        assert!(calls.lock().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn handler_error_aborts_remaining_handlers() {
        #[derive(Debug)]
        struct Boom;
        impl std::fmt::Display for Boom {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("boom")
            }
        }
        impl std::error::Error for Boom {}

        let reached = Arc::new(Mutex::new(false));
        let mut registry = HandlerRegistry::new();
        let r = reached.clone();
        registry
            .register_message(|_, _| Err(Boom.into()))
            .register_message(move |_, _| {
                *r.lock() = true;
                Ok(None)
            });
        let engine = DispatchEngine::new(Arc::new(registry), MatchMode::All);
        let (conn, _rx) = Connection::pair(Handshake::new("/"));

        let err = engine.dispatch(&conn, Some("x")).unwrap_err();
        assert!(err.handler_error().unwrap().downcast_ref::<Boom>().is_some());
        assert!(!*reached.lock());
    }

    #[test]
    fn failed_reply_is_a_send_error() {
        let mut registry = HandlerRegistry::new();
        registry.register_message(|_, _| Ok(Some("reply".into())));
        let engine = DispatchEngine::new(Arc::new(registry), MatchMode::All);
        let (conn, rx) = Connection::pair(Handshake::new("/"));
        drop(rx);

        let err = engine.dispatch(&conn, Some("x")).unwrap_err();
        assert!(matches!(err, DispatchError::Send(_)));
    }

    #[test]
    fn panicking_handler_is_reported_as_handler_error() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_pattern("^PING", PatternFlags::default(), |_, _| panic!("user bug"))
            .unwrap();
        let engine = DispatchEngine::new(Arc::new(registry), MatchMode::All);
        let (conn, _rx) = Connection::pair(Handshake::new("/"));

        let err = engine.dispatch(&conn, Some("PING")).unwrap_err();
        assert!(matches!(err, DispatchError::Handler(_)));
        assert_eq!(err.to_string(), "handler panicked: user bug");
        assert!(conn.is_open());
    }
}
