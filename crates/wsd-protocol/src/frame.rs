//! Outbound frames queued on a connection's writer.

/// A frame queued for delivery to the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text message.
    Text(String),
    /// Ask the writer to send a close frame and stop.
    Close,
}

impl Outbound {
    pub fn text(message: impl Into<String>) -> Self {
        Self::Text(message.into())
    }

    /// The text payload, if this is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Close => None,
        }
    }
}
