//! Queued Adapter Requests

use obd_protocol::{mode, Command, FramingError, PidResponse, RawFrame};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// OBD-II service a request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    /// Service 01
    LiveData,
    /// Service 03
    StoredCodes,
    /// Service 04
    ClearCodes,
}

impl ServiceMode {
    pub fn as_byte(self) -> u8 {
        match self {
            ServiceMode::LiveData => mode::CURRENT_DATA,
            ServiceMode::StoredCodes => mode::READ_DTC,
            ServiceMode::ClearCodes => mode::CLEAR_DTC,
        }
    }

    /// Whether `frame` can be the answer to a request of this mode
    ///
    /// Late answers to an earlier live-data attempt are the frames that show
    /// up unasked; those are rejected here so they never resolve the wrong
    /// request.
    pub fn accepts(self, pid: Option<u8>, frame: &RawFrame) -> bool {
        let live_data = mode::CURRENT_DATA + mode::RESPONSE_OFFSET;
        match (self, pid) {
            (ServiceMode::LiveData, Some(pid)) => PidResponse::answers(pid, frame),
            (ServiceMode::LiveData, None) => true,
            _ => !frame
                .hex_lines()
                .iter()
                .any(|bytes| bytes.first() == Some(&live_data)),
        }
    }
}

/// One request waiting for, or holding, the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRequest {
    /// Assigned by the scheduler, strictly increasing per session
    pub id: u64,
    pub mode: ServiceMode,
    /// Parameter ID, for service 01 only
    pub pid: Option<u8>,
    pub submitted_at: Instant,
    /// Retries spent so far
    pub retries: u32,
}

impl PidRequest {
    fn new(mode: ServiceMode, pid: Option<u8>) -> Self {
        Self {
            id: 0,
            mode,
            pid,
            submitted_at: Instant::now(),
            retries: 0,
        }
    }

    /// Service 01 query for one PID
    pub fn live_data(pid: u8) -> Self {
        Self::new(ServiceMode::LiveData, Some(pid))
    }

    /// Service 03 stored trouble codes
    pub fn stored_codes() -> Self {
        Self::new(ServiceMode::StoredCodes, None)
    }

    /// Service 04 clear trouble codes
    pub fn clear_codes() -> Self {
        Self::new(ServiceMode::ClearCodes, None)
    }

    pub fn command(&self) -> Command {
        Command::Obd {
            mode: self.mode.as_byte(),
            pid: self.pid,
        }
    }

    pub fn accepts(&self, frame: &RawFrame) -> bool {
        self.mode.accepts(self.pid, frame)
    }
}

/// Why a request produced no frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// No matching answer after every attempt
    #[error("Request timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    /// Every attempt produced a corrupt response
    #[error("Request failed after {attempts} attempt(s): {source}")]
    Malformed { attempts: u32, source: FramingError },

    /// The session closed before the request resolved
    #[error("Session closed")]
    SessionClosed,

    /// Submissions are only accepted while the session is ready
    #[error("Session is not ready")]
    SessionNotReady,

    /// The adapter answered with an error token
    #[error("Adapter error: {0}")]
    AdapterError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands() {
        assert_eq!(PidRequest::live_data(0x0C).command().text(), "010C");
        assert_eq!(PidRequest::stored_codes().command().text(), "03");
        assert_eq!(PidRequest::clear_codes().command().text(), "04");
    }

    #[test]
    fn test_live_data_matching() {
        let rpm = PidRequest::live_data(0x0C);
        assert!(rpm.accepts(&RawFrame::from_lines(["41 0C 1A F8"])));
        assert!(rpm.accepts(&RawFrame::from_lines(["NO DATA"])));
        assert!(rpm.accepts(&RawFrame::from_lines(["UNABLE TO CONNECT"])));
        assert!(!rpm.accepts(&RawFrame::from_lines(["41 0D 28"])));
    }

    #[test]
    fn test_stored_codes_ignore_late_live_data() {
        let codes = PidRequest::stored_codes();
        assert!(codes.accepts(&RawFrame::from_lines(["43 01 00 00 00 00 00"])));
        assert!(codes.accepts(&RawFrame::from_lines(["00A", "0: 43 04 01 00 42 00"])));
        assert!(codes.accepts(&RawFrame::from_lines(["NO DATA"])));
        assert!(!codes.accepts(&RawFrame::from_lines(["41 0C 1A F8"])));

        let clear = PidRequest::clear_codes();
        assert!(clear.accepts(&RawFrame::from_lines(["OK"])));
        assert!(clear.accepts(&RawFrame::from_lines(["44"])));
        assert!(!clear.accepts(&RawFrame::from_lines(["41 0D 28"])));
    }
}
