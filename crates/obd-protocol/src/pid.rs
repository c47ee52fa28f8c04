//! OBD-II PID Definitions and Response Parsing
//!
//! Defines the standard Mode 01 Parameter IDs (PIDs) and their SAE J1979
//! decoding formulas.

use crate::error::DecodeError;
use crate::framer::RawFrame;
use crate::mode;
use serde::{Deserialize, Serialize};

/// Standard OBD-II PIDs for Mode 01 (current data)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Mass air flow rate (0x10)
    Maf = 0x10,
    /// Short-term fuel trim bank 1 (0x06)
    ShortFuelTrim = 0x06,
    /// Long-term fuel trim bank 1 (0x07)
    LongFuelTrim = 0x07,
    /// Oxygen sensor voltage bank 1, sensor 1 (0x14)
    O2Voltage = 0x14,
    /// Intake manifold absolute pressure (0x0B)
    IntakeManifoldPressure = 0x0B,
    /// Intake air temperature (0x0F)
    IntakeAirTemp = 0x0F,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
    /// Fuel tank level input (0x2F)
    FuelLevel = 0x2F,
}

impl Pid {
    pub const ALL: [Pid; 12] = [
        Pid::Rpm,
        Pid::Speed,
        Pid::CoolantTemp,
        Pid::EngineLoad,
        Pid::Maf,
        Pid::ShortFuelTrim,
        Pid::LongFuelTrim,
        Pid::O2Voltage,
        Pid::IntakeManifoldPressure,
        Pid::IntakeAirTemp,
        Pid::ThrottlePosition,
        Pid::FuelLevel,
    ];

    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    pub fn from_hex(pid: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_hex() == pid)
    }

    /// Get the number of data bytes in the response for this PID
    ///
    /// O2 voltage carries a second byte (short-term trim) that is not decoded.
    pub fn response_bytes(&self) -> usize {
        match self {
            Pid::Rpm | Pid::Maf | Pid::O2Voltage => 2,
            _ => 1,
        }
    }

    /// Physical unit of the decoded value
    pub fn unit(&self) -> &'static str {
        match self {
            Pid::Rpm => "rpm",
            Pid::Speed => "km/h",
            Pid::CoolantTemp | Pid::IntakeAirTemp => "°C",
            Pid::EngineLoad
            | Pid::ShortFuelTrim
            | Pid::LongFuelTrim
            | Pid::ThrottlePosition
            | Pid::FuelLevel => "%",
            Pid::Maf => "g/s",
            Pid::O2Voltage => "V",
            Pid::IntakeManifoldPressure => "kPa",
        }
    }

    /// Apply the SAE J1979 formula to the data bytes (after `41 <pid>`)
    pub fn decode_value(&self, bytes: &[u8]) -> Result<f64, DecodeError> {
        if bytes.len() < self.response_bytes() {
            return Err(DecodeError::InvalidResponse(format!(
                "PID {:02X} needs {} data bytes, got {}",
                self.as_hex(),
                self.response_bytes(),
                bytes.len()
            )));
        }

        let a = bytes[0] as f64;
        let value = match self {
            // ((A*256)+B)/4
            Pid::Rpm => ((a * 256.0) + bytes[1] as f64) / 4.0,
            // A (km/h)
            Pid::Speed => a,
            // A - 40 (°C)
            Pid::CoolantTemp | Pid::IntakeAirTemp => a - 40.0,
            // A * 100 / 255 (%)
            Pid::EngineLoad | Pid::ThrottlePosition | Pid::FuelLevel => a * 100.0 / 255.0,
            // ((A*256)+B) / 100 (g/s)
            Pid::Maf => ((a * 256.0) + bytes[1] as f64) / 100.0,
            // (A - 128) * 100 / 128 (%)
            Pid::ShortFuelTrim | Pid::LongFuelTrim => (a - 128.0) * 100.0 / 128.0,
            // A / 200 (V)
            Pid::O2Voltage => a / 200.0,
            // A (kPa)
            Pid::IntakeManifoldPressure => a,
        };
        Ok(value)
    }
}

/// Decoded response from a PID query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidResponse {
    /// The PID that was queried
    pub pid: u8,
    /// Timestamp when the response was decoded (Unix ms)
    pub timestamp_ms: u64,
    /// Decoded value
    pub value: f64,
    /// Data bytes from the response, without the `41 <pid>` header
    pub raw_bytes: Vec<u8>,
}

impl PidResponse {
    /// Decode a mode 01 response frame for `pid`
    ///
    /// `Ok(None)` means the vehicle does not support the PID (`NO DATA`, `?`)
    /// or the PID has no known formula.
    pub fn from_frame(
        pid: u8,
        frame: &RawFrame,
        timestamp_ms: u64,
    ) -> Result<Option<Self>, DecodeError> {
        if frame.is_no_data() {
            return Ok(None);
        }
        let Some(known) = Pid::from_hex(pid) else {
            return Ok(None);
        };

        let header = [mode::CURRENT_DATA + mode::RESPONSE_OFFSET, pid];
        let line = frame
            .hex_lines()
            .into_iter()
            .find(|bytes| bytes.starts_with(&header))
            .ok_or_else(|| DecodeError::InvalidResponse(frame.text()))?;

        let raw_bytes = line[2..].to_vec();
        let value = known.decode_value(&raw_bytes)?;
        Ok(Some(Self {
            pid,
            timestamp_ms,
            value,
            raw_bytes,
        }))
    }

    /// Whether a frame is a plausible answer to a mode 01 query for `pid`
    pub fn answers(pid: u8, frame: &RawFrame) -> bool {
        let header = [mode::CURRENT_DATA + mode::RESPONSE_OFFSET, pid];
        frame.is_no_data()
            || frame.adapter_error().is_some()
            || frame.hex_lines().iter().any(|bytes| bytes.starts_with(&header))
    }
}
