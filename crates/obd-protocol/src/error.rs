//! OBD-II Error Types

use thiserror::Error;

/// Errors raised while discovering or opening an adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// No adapter with this identifier is reachable
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The adapter did not accept the connection in time
    #[error("Timeout opening device after {0}ms")]
    Timeout(u64),

    /// A connection is already open on this engine
    #[error("An adapter connection is already open")]
    AlreadyConnected,

    /// A scan is already running
    #[error("A device scan is already in progress")]
    ScanInProgress,

    /// The underlying radio/port service is off or failed
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Errors on an open link
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer went away (BLE disconnect, port unplugged)
    #[error("Link to adapter lost")]
    LinkLost,

    /// The link was already closed locally
    #[error("Link is closed")]
    Closed,

    /// Lower level I/O failure
    #[error("Transport I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof => TransportError::LinkLost,
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Errors while splitting the byte stream into responses
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// No `>` prompt within the byte ceiling
    #[error("Malformed response: {buffered} bytes without a prompt terminator")]
    Malformed { buffered: usize },
}

/// Errors decoding a single field or trouble code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Response text is not what the request expects
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Failure of a single command/response exchange on a connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    /// No matching response before the deadline
    #[error("No response within {0}ms")]
    Timeout(u64),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Link(#[from] TransportError),
}
