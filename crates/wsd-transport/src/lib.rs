//! wsdispatch Transport Layer
//!
//! Provides the WebSocket transport for the dispatch core.
//! The transport layer handles:
//! - The single upgrade endpoint and handshake metadata (correlation cookie)
//! - Per-connection writer tasks fed by [`Connection`] handles
//! - Bridging ordinary HTTP requests to a live connection
//!
//! The transport is decoupled from dispatch logic via the `SocketHandler` trait.

pub mod connection;
pub mod cookie;
pub mod error;
pub mod server;

pub use connection::{Connection, ConnectionState, Handshake};
pub use cookie::correlation_token;
pub use error::{ApiError, TransportError};
pub use server::{InboundStream, SocketHandler, TransportConfig, TransportServer, build_router};
