//! Common error types for the helper peers.

use thiserror::Error;

/// Result type alias using the helper error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for helper operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error (bad URLs, bad pipeline strings)
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport error (signaling or HID socket)
    #[error("transport error: {0}")]
    Transport(String),

    /// Protocol error (unexpected or malformed frames)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Encoder subprocess error
    #[error("encoder error: {0}")]
    Encoder(String),
}

impl Error {
    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create an encoder error from any displayable type.
    pub fn encoder(msg: impl std::fmt::Display) -> Self {
        Self::Encoder(msg.to_string())
    }
}
