//! ELM327 Line Protocol Framing
//!
//! Commands go out as ASCII text terminated by a carriage return. Responses
//! come back as one or more text lines followed by the `>` prompt, possibly
//! split across any number of transport reads.

use crate::error::{DecodeError, FramingError};
use crate::protocol::Command;

/// Prompt character closing every adapter response
pub const PROMPT: u8 = b'>';

/// Command terminator
pub const TERMINATOR: u8 = b'\r';

/// Default ceiling for a single response before it is declared malformed
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4096;

/// Adapter status lines that report a failure instead of data
const ADAPTER_ERRORS: &[&str] = &[
    "UNABLE TO CONNECT",
    "CAN ERROR",
    "BUS ERROR",
    "BUS BUSY",
    "BUFFER FULL",
    "DATA ERROR",
    "FB ERROR",
    "LV RESET",
    "STOPPED",
    "ACT ALERT",
    "LP ALERT",
    "<RX ERROR",
    "ERR",
];

/// Serialize a command into the bytes written to the adapter
pub fn encode(command: &Command) -> Vec<u8> {
    let mut bytes = command.text().into_bytes();
    bytes.push(TERMINATOR);
    bytes
}

/// Parse a line of hex pairs, with or without separating spaces
///
/// Anything other than hex digits and whitespace, including line noise that
/// decoded to non-ASCII text, makes the whole line invalid.
pub fn parse_hex_line(line: &str) -> Result<Vec<u8>, DecodeError> {
    let invalid = || DecodeError::InvalidResponse(line.to_string());
    let digits = line
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_digit(16).ok_or_else(invalid))
        .collect::<Result<Vec<u32>, _>>()?;

    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(invalid());
    }
    Ok(digits
        .chunks_exact(2)
        .map(|pair| (pair[0] << 4 | pair[1]) as u8)
        .collect())
}

/// One complete adapter response, cleaned of echo and noise lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    lines: Vec<String>,
}

impl RawFrame {
    /// Build a frame from already-cleaned lines
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// All lines joined with a single space
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    /// `NO DATA` or `?`: the request was understood but has no answer
    pub fn is_no_data(&self) -> bool {
        self.lines.iter().any(|l| l == "NO DATA" || l == "?")
    }

    /// Generic `OK` acknowledgement
    pub fn is_ok(&self) -> bool {
        self.lines.iter().any(|l| l == "OK")
    }

    /// First line reporting an adapter/bus failure, if any
    pub fn adapter_error(&self) -> Option<&str> {
        self.lines
            .iter()
            .find(|line| {
                ADAPTER_ERRORS.iter().any(|token| line.starts_with(token))
                    || (line.starts_with("BUS INIT") && line.contains("ERROR"))
            })
            .map(String::as_str)
    }

    /// Every line that parses as hex bytes, in order
    pub fn hex_lines(&self) -> Vec<Vec<u8>> {
        self.lines
            .iter()
            .filter_map(|line| parse_hex_line(line).ok())
            .collect()
    }
}

/// Incremental response framer
#[derive(Debug)]
pub struct Framer {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
    /// Dropping bytes until the next prompt after an overflow
    discarding: bool,
    /// Text of the last command, stripped if the adapter echoes it
    echo: Option<String>,
}

impl Framer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes,
            discarding: false,
            echo: None,
        }
    }

    /// Remember the command just written so its echo can be removed
    pub fn expect_echo(&mut self, command: &Command) {
        self.echo = Some(command.text());
    }

    /// Append bytes read from the transport
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for a terminator
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered, returning how many bytes were discarded
    pub fn clear(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.discarding = false;
        dropped
    }

    /// Extract the next complete frame, if one is buffered
    ///
    /// Trailing bytes after a prompt stay buffered for the following call.
    /// Prompts with nothing in front of them are skipped.
    pub fn next_frame(&mut self) -> Option<Result<RawFrame, FramingError>> {
        loop {
            let prompt = self.buffer.iter().position(|&b| b == PROMPT);

            if self.discarding {
                match prompt {
                    Some(i) => {
                        self.buffer.drain(..=i);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        self.buffer.clear();
                        return None;
                    }
                }
            }

            match prompt {
                Some(i) if i > self.max_frame_bytes => {
                    self.buffer.drain(..=i);
                    return Some(Err(FramingError::Malformed { buffered: i }));
                }
                Some(i) => {
                    let body: Vec<u8> = self.buffer.drain(..=i).take(i).collect();
                    let lines = self.clean_lines(&body);
                    if lines.is_empty() {
                        continue;
                    }
                    return Some(Ok(RawFrame { lines }));
                }
                None if self.buffer.len() > self.max_frame_bytes => {
                    let buffered = self.buffer.len();
                    self.buffer.clear();
                    self.discarding = true;
                    return Some(Err(FramingError::Malformed { buffered }));
                }
                None => return None,
            }
        }
    }

    fn clean_lines(&mut self, body: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(body).replace('\0', "");
        let mut lines: Vec<String> = text
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("SEARCHING"))
            .map(str::to_string)
            .collect();

        if let (Some(echo), Some(first)) = (&self.echo, lines.first()) {
            let first: String = first.chars().filter(|c| !c.is_whitespace()).collect();
            if first.eq_ignore_ascii_case(echo) {
                lines.remove(0);
                self.echo = None;
            }
        }

        lines
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}
