//! Vehicle Snapshots
//!
//! A snapshot is best effort: every field is requested, and whatever decodes
//! is kept. An unsupported or garbled PID leaves its field empty.

use obd_protocol::{Pid, PidResponse};
use obd_scheduler::{PidRequest, RequestError, SchedulerHandle, SessionState};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// PIDs requested for every snapshot, in request order
pub const SNAPSHOT_PIDS: [Pid; 7] = [
    Pid::Speed,
    Pid::Rpm,
    Pid::CoolantTemp,
    Pid::EngineLoad,
    Pid::ThrottlePosition,
    Pid::IntakeAirTemp,
    Pid::FuelLevel,
];

/// Live vehicle data captured in one pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    speed_kmh: Option<f64>,
    rpm: Option<f64>,
    coolant_temp_c: Option<f64>,
    engine_load_pct: Option<f64>,
    throttle_pct: Option<f64>,
    intake_air_temp_c: Option<f64>,
    fuel_level_pct: Option<f64>,
    /// Capture time (Unix ms)
    captured_at_ms: u64,
    session_state: SessionState,
}

impl VehicleSnapshot {
    pub fn speed_kmh(&self) -> Option<f64> {
        self.speed_kmh
    }

    pub fn rpm(&self) -> Option<f64> {
        self.rpm
    }

    pub fn coolant_temp_c(&self) -> Option<f64> {
        self.coolant_temp_c
    }

    pub fn engine_load_pct(&self) -> Option<f64> {
        self.engine_load_pct
    }

    pub fn throttle_pct(&self) -> Option<f64> {
        self.throttle_pct
    }

    pub fn intake_air_temp_c(&self) -> Option<f64> {
        self.intake_air_temp_c
    }

    pub fn fuel_level_pct(&self) -> Option<f64> {
        self.fuel_level_pct
    }

    pub fn captured_at_ms(&self) -> u64 {
        self.captured_at_ms
    }

    /// Session state the snapshot was captured under
    pub fn session_state(&self) -> SessionState {
        self.session_state
    }
}

/// Accumulates decoded PIDs into a snapshot
#[derive(Debug)]
pub struct SnapshotBuilder {
    snapshot: VehicleSnapshot,
}

impl SnapshotBuilder {
    pub fn new(session_state: SessionState) -> Self {
        Self {
            snapshot: VehicleSnapshot {
                speed_kmh: None,
                rpm: None,
                coolant_temp_c: None,
                engine_load_pct: None,
                throttle_pct: None,
                intake_air_temp_c: None,
                fuel_level_pct: None,
                captured_at_ms: now_ms(),
                session_state,
            },
        }
    }

    /// Update a field from a PID response
    pub fn update(&mut self, response: &PidResponse) {
        let s = &mut self.snapshot;
        let value = Some(response.value);
        match Pid::from_hex(response.pid) {
            Some(Pid::Speed) => s.speed_kmh = value,
            Some(Pid::Rpm) => s.rpm = value,
            Some(Pid::CoolantTemp) => s.coolant_temp_c = value,
            Some(Pid::EngineLoad) => s.engine_load_pct = value,
            Some(Pid::ThrottlePosition) => s.throttle_pct = value,
            Some(Pid::IntakeAirTemp) => s.intake_air_temp_c = value,
            Some(Pid::FuelLevel) => s.fuel_level_pct = value,
            _ => {}
        }
    }

    pub fn build(self) -> VehicleSnapshot {
        self.snapshot
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Request every snapshot PID and assemble the answers
///
/// All requests are queued up front so they go out back to back. Closing
/// the session aborts the capture; any other per-PID failure only empties
/// that field, unless no PID could be read at all.
pub async fn capture(
    scheduler: &SchedulerHandle,
    session_state: SessionState,
) -> Result<VehicleSnapshot, RequestError> {
    let pending = SNAPSHOT_PIDS
        .iter()
        .map(|&pid| {
            scheduler
                .enqueue(PidRequest::live_data(pid.as_hex()))
                .map(|request| (pid, request))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = SnapshotBuilder::new(session_state);
    let mut answered = 0;
    let mut first_error = None;

    for (pid, request) in pending {
        let frame = match request.response().await {
            Ok(frame) => frame,
            Err(e @ (RequestError::SessionClosed | RequestError::SessionNotReady)) => return Err(e),
            Err(e) => {
                warn!("PID {:02X} unavailable for snapshot: {}", pid.as_hex(), e);
                first_error.get_or_insert(e);
                continue;
            }
        };

        answered += 1;
        match PidResponse::from_frame(pid.as_hex(), &frame, now_ms()) {
            Ok(Some(response)) => builder.update(&response),
            Ok(None) => debug!("PID {:02X} not supported by vehicle", pid.as_hex()),
            Err(e) => warn!("PID {:02X} could not be decoded: {}", pid.as_hex(), e),
        }
    }

    match first_error {
        Some(e) if answered == 0 => Err(e),
        _ => Ok(builder.build()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_maps_pids() {
        let mut builder = SnapshotBuilder::new(SessionState::Ready);
        for (pid, value) in [(0x0D, 40.0), (0x0C, 1726.0), (0x2F, 50.0), (0x10, 5.0)] {
            builder.update(&PidResponse {
                pid,
                timestamp_ms: 0,
                value,
                raw_bytes: Vec::new(),
            });
        }

        let snapshot = builder.build();
        assert_eq!(snapshot.speed_kmh(), Some(40.0));
        assert_eq!(snapshot.rpm(), Some(1726.0));
        assert_eq!(snapshot.fuel_level_pct(), Some(50.0));
        assert_eq!(snapshot.coolant_temp_c(), None);
        assert_eq!(snapshot.session_state(), SessionState::Ready);
        assert!(snapshot.captured_at_ms() > 0);
    }

    #[test]
    fn test_snapshot_serializes_absent_fields_as_null() {
        let snapshot = SnapshotBuilder::new(SessionState::Polling).build();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["rpm"].is_null());
        assert_eq!(json["session_state"], "polling");
    }
}
