//! OBD-II Protocol Implementation
//!
//! This crate provides async communication with ELM327-compatible OBD-II
//! adapters: a transport abstraction over BLE/serial byte streams, the
//! adapter's line framing, and SAE J1979 decoding of live data and trouble
//! codes.

mod connection;
mod dtc;
mod error;
mod framer;
mod pid;
mod protocol;
mod scan;
mod serial;
mod sim;
mod transport;

pub use connection::{Connection, ConnectionState};
pub use dtc::{
    decode_trouble_codes, describe, is_clear_acknowledged, DtcCategory, Severity, TroubleCode,
};
pub use error::{ConnectionError, DecodeError, ExchangeError, FramingError, TransportError};
pub use framer::{encode, parse_hex_line, Framer, RawFrame, DEFAULT_MAX_FRAME_BYTES, PROMPT};
pub use pid::{Pid, PidResponse};
pub use protocol::{at, Command, ObdProtocol};
pub use scan::{DeviceScan, ScanCanceller};
pub use serial::SerialTransport;
pub use sim::{SimControl, SimResponse, SimulatedTransport};
pub use transport::{Advertisement, DiscoveredDevice, Link, Transport, TransportAdapter};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Added to the request mode in positive responses (`01` -> `41`)
    pub const RESPONSE_OFFSET: u8 = 0x40;
}
