//! wsdispatch - Protocol Types
//!
//! Leaf types shared by the transport and the dispatch core: connection
//! identities, correlation tokens, outbound frames, dispatch modes, and the
//! error taxonomy. Nothing in this crate performs I/O.

pub mod dispatch;
pub mod error;
pub mod frame;
pub mod ids;

pub use dispatch::{MatchMode, PatternFlags};
pub use error::{DispatchError, HandlerError, SendError, NO_ACTIVE_CONTEXT_MESSAGE};
pub use frame::Outbound;
pub use ids::{ConnectionId, CorrelationToken};

/// Crate version, logged at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
