//! wsdispatch Server — the connection-dispatch core.
//!
//! Tracks open connections, routes inbound messages to registered handlers,
//! and makes "the current connection" available to handler code and to
//! HTTP requests bridged through a correlation token.

pub mod bridge;
pub mod context;
pub mod correlation;
pub mod handlers;
pub mod hub;
pub mod lifecycle;
pub mod registry;
pub mod router;

pub use bridge::CrossChannelBridge;
pub use context::{ContextGuard, ContextStack, current, has_context, send_to_current};
pub use correlation::CorrelationIndex;
pub use handlers::{HandlerRegistry, MessageResult};
pub use hub::{DispatchConfig, SocketHub};
pub use lifecycle::ConnectionLifecycle;
pub use registry::{BroadcastReport, ConnectionRegistry};
pub use router::{DispatchEngine, DispatchOutcome};
