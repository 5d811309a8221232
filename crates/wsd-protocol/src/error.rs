//! Error taxonomy for the dispatch layer.

use crate::ids::ConnectionId;

/// Error type returned by application handlers.
///
/// Boxed so the application keeps its own error type; callers can
/// `downcast_ref` to recover it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Guidance shown when current-connection access happens outside any context.
pub const NO_ACTIVE_CONTEXT_MESSAGE: &str = "\
Working outside of websocket context.

This typically means that you attempted to use functionality that needed
to interface with the current websocket connection in some way.

If you want to reply to an HTTP request using a websocket of the same client,
first make sure your websocket is connected.
The client must also carry a correlation cookie so that it can be identified.
Set the cookie in your first response and use the same key when configuring
the transport (`correlation_cookie`).

To check if you are in a proper websocket context (or a socket is connected
where you expect it to be), use `has_context()`.";

/// A send to a single connection failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The connection is closing, closed, or its writer has gone away.
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

/// Errors surfaced by the registries, the dispatch engine, and context access.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Unregistering a connection that was never registered (or already removed).
    #[error("connection {0} is not registered")]
    NotRegistered(ConnectionId),

    /// Current-connection access outside any active context.
    #[error("{}", NO_ACTIVE_CONTEXT_MESSAGE)]
    NoActiveContext,

    /// A context frame was entered on a task with no context stack installed.
    #[error("no connection context stack is installed for this task")]
    OutsideScope,

    /// An application handler failed. The source is the handler's own error.
    #[error(transparent)]
    Handler(HandlerError),

    /// A direct send on a single connection failed.
    #[error(transparent)]
    Send(#[from] SendError),

    /// A handler pattern failed to compile.
    #[error("invalid handler pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

impl DispatchError {
    pub fn is_no_active_context(&self) -> bool {
        matches!(self, Self::NoActiveContext)
    }

    /// The application error behind a `Handler` failure, if any.
    pub fn handler_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Handler(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
