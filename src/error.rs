//! Error types

use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The directory task has shut down and no longer accepts commands
    #[error("Presence directory is not running")]
    DirectoryClosed,
}

/// Socket-level failures.
///
/// Messages are kept as strings so the error can be cloned into
/// [`ConnectionEvent::Error`](crate::network::signaling::ConnectionEvent).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Failed to bind socket: {0}")]
    BindFailed(String),

    #[error("Failed to join multicast group: {0}")]
    JoinFailed(String),

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("Failed to accept connection: {0}")]
    AcceptFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("No usable local IPv4 address: {0}")]
    AddressResolution(String),
}

/// Wire format failures
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes (max {1})")]
    TooLarge(usize, usize),
}
