//! OBD-II Session State and Request Scheduling
//!
//! The adapter is strictly half-duplex: one command, one response. This crate
//! owns the session lifecycle and funnels every request through a single
//! actor that holds the connection, so callers never serialize themselves.

mod request;
mod scheduler;
mod state;

pub use request::{PidRequest, RequestError, ServiceMode};
pub use scheduler::{PendingRequest, Scheduler, SchedulerConfig, SchedulerEvent, SchedulerHandle};
pub use state::{SessionError, SessionState, SessionStateMachine};
