//! Engine Error Types

use obd_protocol::{ConnectionError, DecodeError};
use obd_scheduler::RequestError;
use std::fmt;
use thiserror::Error;

/// Handshake step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// `ATZ`
    Reset,
    /// `ATE0`
    EchoOff,
    /// `ATSPn`
    SetProtocol,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStep::Reset => "reset",
            HandshakeStep::EchoOff => "echo off",
            HandshakeStep::SetProtocol => "set protocol",
        };
        f.write_str(name)
    }
}

/// What went wrong in the last attempt of a handshake step
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeCause {
    #[error("no response")]
    Timeout,

    #[error("unexpected response {0:?}")]
    Unexpected(String),

    #[error("malformed response")]
    Framing,

    #[error("link lost")]
    Link,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Handshake failed at {step} after {attempts} attempt(s): {cause}")]
pub struct HandshakeError {
    pub step: HandshakeStep,
    pub attempts: u32,
    pub cause: HandshakeCause,
}

/// Failure of `connect`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// `disconnect` was called before the handshake finished
    #[error("Connect aborted by disconnect")]
    Aborted,
}

/// Failure of `clear_trouble_codes`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClearError {
    /// The adapter answered something other than `OK`
    #[error("Unexpected clear response: {0}")]
    Unexpected(String),

    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Failure of `read_trouble_codes`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TroubleCodeError {
    /// The answer held no service 03 payload at all
    #[error("Unreadable trouble code response: {0}")]
    Undecodable(#[from] DecodeError),

    #[error(transparent)]
    Request(#[from] RequestError),
}
