//! OBD-II Diagnostic Engine
//!
//! Discovery, connection lifecycle and diagnostics for ELM327-class adapters.
//! A [`DiagnosticEngine`] is built explicitly on top of a transport backend
//! and exposes scanning, connect/disconnect, live snapshots, periodic polling
//! and trouble code access.

mod config;
mod engine;
mod error;
mod logging;
mod poller;
mod session;
mod snapshot;

pub use self::config::{
    EngineConfig, HandshakeConfig, LoggingConfig, PollingConfig, ScanConfig, TransportConfig,
    TransportKind,
};
pub use engine::DiagnosticEngine;
pub use error::{
    ClearError, ConnectError, HandshakeCause, HandshakeError, HandshakeStep, TroubleCodeError,
};
pub use logging::init_logging;
pub use session::SessionInfo;
pub use snapshot::{SnapshotBuilder, VehicleSnapshot, SNAPSHOT_PIDS};

pub use obd_protocol::{
    DiscoveredDevice, DtcCategory, ObdProtocol, RawFrame, SerialTransport, Severity,
    SimulatedTransport, Transport, TroubleCode,
};
pub use obd_scheduler::{PidRequest, RequestError, SchedulerConfig, SessionError, SessionState};
