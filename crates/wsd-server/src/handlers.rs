//! HandlerRegistry — ordered open, message, and close handlers.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use regex::Regex;
use tracing::debug;
use wsd_protocol::{DispatchError, HandlerError, PatternFlags};
use wsd_transport::Connection;

/// Result of a message handler: an optional reply sent back on the connection.
pub type MessageResult = Result<Option<String>, HandlerError>;

/// Handler invoked when a connection opens or closes.
pub type LifecycleHandler = Arc<dyn Fn(&Connection) -> Result<(), HandlerError> + Send + Sync>;

/// Handler invoked with an inbound message.
pub type MessageHandler = Arc<dyn Fn(&Connection, &str) -> MessageResult + Send + Sync>;

/// A message handler qualified by a start-anchored pattern.
#[derive(Clone)]
pub struct PatternHandler {
    pattern: Regex,
    source: String,
    handler: MessageHandler,
}

impl PatternHandler {
    /// Whether the message begins with a match for this handler's pattern.
    pub fn matches(&self, message: &str) -> bool {
        self.pattern.is_match(message)
    }

    /// The pattern as registered (without the start anchor).
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn handler(&self) -> &MessageHandler {
        &self.handler
    }
}

/// Four independent handler sequences, each kept in registration order.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    open: Vec<LifecycleHandler>,
    pattern: Vec<PatternHandler>,
    catch_all: Vec<MessageHandler>,
    close: Vec<LifecycleHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_open<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Connection) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.open.push(Arc::new(handler));
        self
    }

    pub fn register_close<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Connection) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.close.push(Arc::new(handler));
        self
    }

    /// Register a catch-all message handler.
    pub fn register_message<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Connection, &str) -> MessageResult + Send + Sync + 'static,
    {
        self.catch_all.push(Arc::new(handler));
        self
    }

    /// Register a handler for messages that begin with a match for `pattern`.
    pub fn register_pattern<F>(
        &mut self,
        pattern: &str,
        flags: PatternFlags,
        handler: F,
    ) -> Result<&mut Self, DispatchError>
    where
        F: Fn(&Connection, &str) -> MessageResult + Send + Sync + 'static,
    {
        let compiled = flags.compile(pattern)?;
        debug!("Registered pattern handler: {pattern}");
        self.pattern.push(PatternHandler {
            pattern: compiled,
            source: pattern.to_string(),
            handler: Arc::new(handler),
        });
        Ok(self)
    }

    pub fn open_handlers(&self) -> &[LifecycleHandler] {
        &self.open
    }

    pub fn pattern_handlers(&self) -> &[PatternHandler] {
        &self.pattern
    }

    pub fn catch_all_handlers(&self) -> &[MessageHandler] {
        &self.catch_all
    }

    pub fn close_handlers(&self) -> &[LifecycleHandler] {
        &self.close
    }
}

/// Call a handler, turning a panic into a [`HandlerError`] so the caller's
/// cleanup still runs.
pub(crate) fn call_handler<T>(
    f: impl FnOnce() -> Result<T, HandlerError>,
) -> Result<T, HandlerError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(format!("handler panicked: {}", panic_message(payload.as_ref())).into())
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
