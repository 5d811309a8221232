//! CrossChannelBridge — lends a live connection to an unrelated request.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;
use wsd_protocol::CorrelationToken;
use wsd_transport::Connection;

use crate::context::{self, ContextGuard};
use crate::correlation::CorrelationIndex;

/// Makes the connection correlated with a request's token current for the
/// duration of that request.
#[derive(Clone)]
pub struct CrossChannelBridge {
    correlation: Arc<CorrelationIndex>,
}

impl CrossChannelBridge {
    pub fn new(correlation: Arc<CorrelationIndex>) -> Self {
        Self { correlation }
    }

    /// The open connection correlated with `token`, if any.
    pub fn resolve(&self, token: Option<&CorrelationToken>) -> Option<Connection> {
        token
            .and_then(|token| self.correlation.resolve(token))
            .filter(Connection::is_open)
    }

    /// Run `request` with the resolved connection as the current context.
    ///
    /// The frame goes on the current task's stack when one is installed,
    /// and on a new stack otherwise. It is released when `request`
    /// completes or is dropped.
    pub async fn scope<F: Future>(&self, token: Option<&CorrelationToken>, request: F) -> F::Output {
        let conn = self.resolve(token);
        if conn.is_none() && token.is_some() {
            debug!("No live connection for correlation token; running without context");
        }

        context::ensure_scope(async move {
            let _guard = conn.and_then(|conn| ContextGuard::enter(conn).ok());
            request.await
        })
        .await
    }
}
