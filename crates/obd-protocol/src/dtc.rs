//! Diagnostic Trouble Codes
//!
//! Service 03 answers with `43` followed by two-byte code groups. The top two
//! bits of the first byte pick the system letter, the remaining 14 bits are
//! the four digits of the code:
//!
//! ```text
//!   01 00  ->  00|00 0001 0000 0000  ->  P0100
//!   42 00  ->  01|00 0010 0000 0000  ->  C0200
//! ```
//!
//! CAN adapters may prefix the payload with a count byte and split long
//! answers over indexed lines (`0: 43 04 ...`, `1: ...`).

use crate::error::DecodeError;
use crate::framer::{parse_hex_line, RawFrame};
use crate::mode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Vehicle system a trouble code belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtcCategory {
    Powertrain,
    Chassis,
    Body,
    Network,
}

impl DtcCategory {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => DtcCategory::Powertrain,
            0b01 => DtcCategory::Chassis,
            0b10 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    fn bits(self) -> u8 {
        match self {
            DtcCategory::Powertrain => 0b00,
            DtcCategory::Chassis => 0b01,
            DtcCategory::Body => 0b10,
            DtcCategory::Network => 0b11,
        }
    }

    pub fn letter(self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }

    fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'P' => Some(DtcCategory::Powertrain),
            'C' => Some(DtcCategory::Chassis),
            'B' => Some(DtcCategory::Body),
            'U' => Some(DtcCategory::Network),
            _ => None,
        }
    }
}

/// How urgently a code should be presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

const UNKNOWN_DESCRIPTION: &str = "Unknown trouble code";

/// Generic SAE J2012 descriptions for common codes
const DESCRIPTIONS: &[(&str, &str)] = &[
    ("P0100", "Mass or Volume Air Flow Circuit Malfunction"),
    ("P0101", "Mass or Volume Air Flow Circuit Range/Performance Problem"),
    ("P0110", "Intake Air Temperature Circuit Malfunction"),
    ("P0115", "Engine Coolant Temperature Circuit Malfunction"),
    ("P0120", "Throttle Position Sensor/Switch A Circuit Malfunction"),
    ("P0130", "O2 Sensor Circuit Malfunction (Bank 1 Sensor 1)"),
    ("P0171", "System Too Lean (Bank 1)"),
    ("P0172", "System Too Rich (Bank 1)"),
    ("P0200", "Injector Circuit Malfunction"),
    ("P0300", "Random/Multiple Cylinder Misfire Detected"),
    ("P0301", "Cylinder 1 Misfire Detected"),
    ("P0302", "Cylinder 2 Misfire Detected"),
    ("P0303", "Cylinder 3 Misfire Detected"),
    ("P0304", "Cylinder 4 Misfire Detected"),
    ("P0420", "Catalyst System Efficiency Below Threshold (Bank 1)"),
    ("P0440", "Evaporative Emission Control System Malfunction"),
    ("P0442", "Evaporative Emission Control System Leak Detected (small leak)"),
    ("P0455", "Evaporative Emission Control System Leak Detected (large leak)"),
    ("P0500", "Vehicle Speed Sensor Malfunction"),
    ("P0505", "Idle Control System Malfunction"),
    ("P0700", "Transmission Control System Malfunction"),
    ("U0100", "Lost Communication With ECM/PCM A"),
];

/// Look up the generic description of a code
pub fn describe(code: &str) -> &'static str {
    DESCRIPTIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, d)| *d)
        .unwrap_or(UNKNOWN_DESCRIPTION)
}

/// A decoded trouble code such as `P0100`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TroubleCode {
    /// Full five-character code
    pub code: String,
    pub category: DtcCategory,
    /// Human description, or "Unknown trouble code"
    pub description: String,
}

impl TroubleCode {
    /// Decode one two-byte group
    pub fn from_bytes(high: u8, low: u8) -> Self {
        let category = DtcCategory::from_bits(high >> 6);
        let code = format!(
            "{}{}{:X}{:02X}",
            category.letter(),
            (high >> 4) & 0b11,
            high & 0x0F,
            low
        );
        let description = describe(&code).to_string();
        Self {
            code,
            category,
            description,
        }
    }

    /// Encode back into the two bytes the adapter would report
    pub fn to_bytes(&self) -> [u8; 2] {
        let digits = self.code.as_bytes().get(1..).unwrap_or_default();
        let nibble = |i: usize| {
            digits
                .get(i)
                .and_then(|&d| (d as char).to_digit(16))
                .unwrap_or(0) as u8
        };
        [
            (self.category.bits() << 6) | (nibble(0) << 4) | nibble(1),
            (nibble(2) << 4) | nibble(3),
        ]
    }

    pub fn severity(&self) -> Severity {
        match (self.category, self.code.as_bytes().get(1)) {
            (DtcCategory::Powertrain, Some(b'0')) => Severity::Warning,
            (DtcCategory::Powertrain, Some(b'1')) => Severity::Error,
            (DtcCategory::Chassis, _) => Severity::Warning,
            (DtcCategory::Network, _) => Severity::Error,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for TroubleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

impl FromStr for TroubleCode {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DecodeError::InvalidResponse(format!("not a trouble code: {}", s));
        let mut chars = s.chars();
        let category = chars
            .next()
            .and_then(DtcCategory::from_letter)
            .ok_or_else(invalid)?;
        let digits: String = chars.collect();

        let valid = digits.len() == 4
            && digits.chars().all(|c| c.is_ascii_hexdigit())
            && digits.chars().next().is_some_and(|c| ('0'..='3').contains(&c));
        if !valid {
            return Err(invalid());
        }

        let code = format!("{}{}", category.letter(), digits.to_ascii_uppercase());
        let description = describe(&code).to_string();
        Ok(Self {
            code,
            category,
            description,
        })
    }
}

/// Split an `N: ..` continuation prefix off an ISO-TP line
fn split_index(line: &str) -> Option<(u8, &str)> {
    let (index, rest) = line.split_once(':')?;
    let index = u8::from_str_radix(index.trim(), 16).ok()?;
    Some((index, rest))
}

/// Collect each ECU's service 03 payload as raw bytes
///
/// Status lines (`BUS INIT: ...OK`, `SEARCHING...`) and line noise are
/// skipped so they cannot hide the codes around them.
fn responses(frame: &RawFrame) -> Vec<Vec<u8>> {
    let mut plain = Vec::new();
    let mut indexed: Vec<(u8, Vec<u8>)> = Vec::new();
    let mut total: Option<usize> = None;

    for line in frame.lines() {
        if let Some((index, rest)) = split_index(line) {
            match parse_hex_line(rest) {
                Ok(bytes) => indexed.push((index, bytes)),
                Err(_) => debug!("Skipping unreadable segment {:?}", line),
            }
            continue;
        }
        let compact = line.split_whitespace().collect::<String>();
        // bare byte-count header of a multi-frame answer, e.g. `00A`
        if compact.len() == 3 {
            if let Ok(len) = usize::from_str_radix(&compact, 16) {
                total = Some(len);
                continue;
            }
        }
        match parse_hex_line(line) {
            Ok(bytes) => plain.push(bytes),
            Err(_) => debug!("Skipping non-data line {:?}", line),
        }
    }

    if !indexed.is_empty() {
        indexed.sort_by_key(|(index, _)| *index);
        let mut joined: Vec<u8> = indexed.into_iter().flat_map(|(_, bytes)| bytes).collect();
        // last segment is padded out to the frame size
        if let Some(len) = total {
            joined.truncate(len);
        }
        plain.push(joined);
    }
    plain
}

/// Decode a service 03 response into trouble codes
///
/// Codes keep adapter order; repeats (several ECUs, padding) are collapsed.
/// `NO DATA` is an empty set. A response without a single `43` payload is
/// invalid.
pub fn decode_trouble_codes(frame: &RawFrame) -> Result<Vec<TroubleCode>, DecodeError> {
    if frame.is_no_data() {
        return Ok(Vec::new());
    }

    let header = mode::READ_DTC + mode::RESPONSE_OFFSET;
    let mut codes: Vec<TroubleCode> = Vec::new();
    let mut payloads = 0;

    for response in responses(frame) {
        let Some((&first, payload)) = response.split_first() else {
            continue;
        };
        if first != header {
            warn!("Ignoring non service 03 data {:02X?}", response);
            continue;
        }
        payloads += 1;

        // CAN answers carry a count byte, which makes the payload odd
        let payload = if payload.len() % 2 == 1 {
            &payload[1..]
        } else {
            payload
        };

        for pair in payload.chunks_exact(2) {
            if pair == [0, 0] {
                continue;
            }
            let code = TroubleCode::from_bytes(pair[0], pair[1]);
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
    }

    if payloads == 0 {
        return Err(DecodeError::InvalidResponse(frame.text()));
    }
    Ok(codes)
}

/// Whether a service 04 answer confirms the clear
pub fn is_clear_acknowledged(frame: &RawFrame) -> bool {
    frame.lines().len() == 1 && frame.is_ok()
}
