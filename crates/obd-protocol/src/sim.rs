//! Simulated ELM327 Adapter
//!
//! A [`Transport`] that behaves like a Bluetooth ELM327 dongle plugged into a
//! healthy vehicle: it advertises a few adapters, echoes commands until
//! `ATE0`, answers the common AT set and a handful of mode 01/03/04 requests,
//! and replies `?` to anything else. Responses can be scripted per command,
//! delayed, split into small chunks, or suppressed entirely, and the link can
//! be dropped on demand.

use crate::error::{ConnectionError, TransportError};
use crate::transport::{Advertisement, DiscoveredDevice, Link, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Scripted behaviour for one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimResponse {
    /// Reply with these lines (separated by `\r`)
    Reply(String),
    /// Never answer
    Silent,
    /// Stay silent for the first `times` requests, then reply
    SilentThen { times: u32, reply: String },
}

#[derive(Debug, Default)]
struct SimShared {
    script: Mutex<HashMap<String, SimResponse>>,
    hits: Mutex<HashMap<String, u32>>,
    writes: Mutex<Vec<String>>,
    link_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    /// A prompt has been produced but not yet read by the host
    awaiting_read: AtomicBool,
    overlaps: AtomicUsize,
    codes_cleared: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Inspection and fault injection for a running simulator
#[derive(Debug, Clone)]
pub struct SimControl {
    shared: Arc<SimShared>,
}

impl SimControl {
    /// Every command received so far, in arrival order
    pub fn writes(&self) -> Vec<String> {
        lock(&self.shared.writes).clone()
    }

    /// Number of times `command` was received
    pub fn count(&self, command: &str) -> usize {
        lock(&self.shared.writes).iter().filter(|w| *w == command).count()
    }

    /// Commands that arrived while a previous response was still unread
    pub fn overlaps(&self) -> usize {
        self.shared.overlaps.load(Ordering::SeqCst)
    }

    /// Change the scripted response of a command
    pub fn set_response(&self, command: &str, response: SimResponse) {
        lock(&self.shared.script).insert(command.to_ascii_uppercase(), response);
    }

    /// Simulate the adapter going out of range
    pub fn drop_link(&self) {
        debug!("Simulator dropping link");
        lock(&self.shared.link_tx).take();
    }
}

/// Simulated BLE transport with an ELM327 behind every device
#[derive(Debug)]
pub struct SimulatedTransport {
    devices: Vec<DiscoveredDevice>,
    advertise_rounds: usize,
    advertise_interval: Duration,
    available: bool,
    open_delay: Duration,
    chunk_size: usize,
    latency: Duration,
    shared: Arc<SimShared>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self {
            devices: vec![
                DiscoveredDevice::new("sim-001", "OBD2 Simulator", Some(-58)),
                DiscoveredDevice::new("sim-002", "ELM327 Bluetooth", Some(-71)),
                DiscoveredDevice::new("sim-003", "Veepeak OBDCheck", None),
            ],
            advertise_rounds: 2,
            advertise_interval: Duration::from_millis(50),
            available: true,
            open_delay: Duration::ZERO,
            chunk_size: 0,
            latency: Duration::ZERO,
            shared: Arc::new(SimShared::default()),
        }
    }
}

impl SimulatedTransport {
    pub fn with_devices(mut self, devices: Vec<DiscoveredDevice>) -> Self {
        self.devices = devices;
        self
    }

    /// How many times each device is advertised before the scan feed closes
    pub fn with_advertise_rounds(mut self, rounds: usize) -> Self {
        self.advertise_rounds = rounds;
        self
    }

    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Split every response into reads of at most `size` bytes (0 = whole)
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Delay between receiving a command and emitting its response
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_response(self, command: &str, response: SimResponse) -> Self {
        lock(&self.shared.script).insert(command.to_ascii_uppercase(), response);
        self
    }

    pub fn control(&self) -> SimControl {
        SimControl {
            shared: self.shared.clone(),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, ConnectionError> {
        let (tx, rx) = mpsc::channel(16);
        let devices = self.devices.clone();
        let rounds = self.advertise_rounds;
        let interval = self.advertise_interval;

        tokio::spawn(async move {
            for _ in 0..rounds {
                for device in &devices {
                    let name = Some(device.name().to_string()).filter(|n| !n.is_empty());
                    let advertisement = Advertisement {
                        id: device.id().to_string(),
                        name,
                        rssi: device.rssi(),
                    };
                    if tx.send(advertisement).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(interval).await;
                }
            }
        });

        Ok(rx)
    }

    async fn open(&self, device_id: &str) -> Result<Box<dyn Link>, ConnectionError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if !self.devices.iter().any(|d| d.id() == device_id) {
            return Err(ConnectionError::NotFound(device_id.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.link_tx) = Some(tx);
        self.shared.awaiting_read.store(false, Ordering::SeqCst);

        Ok(Box::new(SimLink {
            shared: self.shared.clone(),
            rx,
            input: Vec::new(),
            echo: true,
            chunk_size: self.chunk_size,
            latency: self.latency,
        }))
    }
}

struct SimLink {
    shared: Arc<SimShared>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    input: Vec<u8>,
    echo: bool,
    chunk_size: usize,
    latency: Duration,
}

impl SimLink {
    fn respond(&mut self, command: &str) -> Result<(), TransportError> {
        lock(&self.shared.writes).push(command.to_string());
        if self.shared.awaiting_read.load(Ordering::SeqCst) {
            self.shared.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        let Some(reply) = self.reply_for(command) else {
            trace!("Simulator ignoring {}", command);
            return Ok(());
        };

        let mut output = String::new();
        if self.echo {
            output.push_str(command);
            output.push('\r');
        }
        output.push_str(&reply);
        output.push_str("\r\r>");

        match command {
            "ATZ" | "ATE1" => self.echo = true,
            "ATE0" => self.echo = false,
            _ => {}
        }

        let bytes = output.into_bytes();
        let chunks: Vec<Vec<u8>> = if self.chunk_size == 0 {
            vec![bytes]
        } else {
            bytes.chunks(self.chunk_size).map(<[u8]>::to_vec).collect()
        };

        let tx = lock(&self.shared.link_tx)
            .clone()
            .ok_or(TransportError::LinkLost)?;
        self.shared.awaiting_read.store(true, Ordering::SeqCst);

        if self.latency.is_zero() {
            for chunk in chunks {
                tx.send(chunk).map_err(|_| TransportError::LinkLost)?;
            }
        } else {
            let latency = self.latency;
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                for chunk in chunks {
                    if tx.send(chunk).is_err() {
                        break;
                    }
                }
            });
        }
        Ok(())
    }

    fn reply_for(&self, command: &str) -> Option<String> {
        let scripted = lock(&self.shared.script).get(command).cloned();
        match scripted {
            Some(SimResponse::Reply(reply)) => Some(reply),
            Some(SimResponse::Silent) => None,
            Some(SimResponse::SilentThen { times, reply }) => {
                let mut hits = lock(&self.shared.hits);
                let seen = hits.entry(command.to_string()).or_insert(0);
                *seen += 1;
                (*seen > times).then_some(reply)
            }
            None => Some(self.default_reply(command)),
        }
    }

    fn default_reply(&self, command: &str) -> String {
        let reply = match command {
            "ATZ" => "ELM327 v1.5",
            "ATI" => "ELM327 v1.5",
            "ATDPN" => "A6",
            c if c.starts_with("ATE")
                || c.starts_with("ATL")
                || c.starts_with("ATH")
                || c.starts_with("ATS")
                || c.starts_with("ATAT") =>
            {
                "OK"
            }
            "0100" => "41 00 BE 3F A8 13",
            "0104" => "41 04 64",
            "0105" => "41 05 7B",
            "010B" => "41 0B 21",
            "010C" => "41 0C 1A F8",
            "010D" => "41 0D 28",
            "010F" => "41 0F 38",
            "0110" => "41 10 01 F4",
            "0111" => "41 11 45",
            "012F" => "41 2F 80",
            "03" if self.shared.codes_cleared.load(Ordering::SeqCst) => "43 00",
            "03" => "43 02 01 00 42 00",
            "04" => {
                self.shared.codes_cleared.store(true, Ordering::SeqCst);
                "OK"
            }
            c if c.len() == 4 && c.starts_with("01") => "NO DATA",
            _ => "?",
        };
        reply.to_string()
    }
}

#[async_trait]
impl Link for SimLink {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if lock(&self.shared.link_tx).is_none() {
            return Err(TransportError::LinkLost);
        }

        self.input.extend_from_slice(bytes);
        while let Some(pos) = self.input.iter().position(|&b| b == b'\r') {
            let line: Vec<u8> = self.input.drain(..=pos).collect();
            let command = String::from_utf8_lossy(&line).trim().to_ascii_uppercase();
            if !command.is_empty() {
                self.respond(&command)?;
            }
        }
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
        let chunk = self.rx.recv().await.ok_or(TransportError::LinkLost)?;
        if chunk.contains(&b'>') {
            self.shared.awaiting_read.store(false, Ordering::SeqCst);
        }
        Ok(chunk)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.rx.close();
        Ok(())
    }
}
