//! Transport errors and HTTP mapping of dispatch errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use wsd_protocol::DispatchError;

/// Errors raised by the transport itself.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),
}

/// Wraps a [`DispatchError`] so HTTP routes can return it with `?`.
#[derive(Debug)]
pub struct ApiError(pub DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DispatchError::NoActiveContext => StatusCode::CONFLICT,
            DispatchError::NotRegistered(_) => StatusCode::NOT_FOUND,
            DispatchError::Send(_) => StatusCode::GONE,
            DispatchError::OutsideScope
            | DispatchError::Handler(_)
            | DispatchError::InvalidPattern(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.0.to_string()).into_response()
    }
}
