//! Transport Abstraction
//!
//! A [`Transport`] is the platform service that can find adapters and open a
//! byte link to one of them (BLE GATT write/notify pair, RFCOMM or USB serial
//! port, simulator). [`TransportAdapter`] wraps a backend with the engine-wide
//! rules: one open connection at a time, one scan at a time, deduplicated
//! and time-bounded discovery.

use crate::connection::{Connection, ConnectionState};
use crate::error::{ConnectionError, TransportError};
use crate::framer::DEFAULT_MAX_FRAME_BYTES;
use crate::scan::DeviceScan;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Raw advertisement as reported by a backend, before filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// An adapter seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    id: String,
    name: String,
    rssi: Option<i16>,
}

impl DiscoveredDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>, rssi: Option<i16>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi,
        }
    }

    /// Opaque transport address used to connect
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal strength in dBm, when the backend reports it
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }
}

/// Platform service able to discover adapters and open links to them
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the radio/port service is usable right now
    async fn is_available(&self) -> bool;

    /// Start reporting advertisements
    ///
    /// The backend stops scanning once the returned receiver is dropped or
    /// when it closes the channel itself.
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, ConnectionError>;

    /// Open a byte link to the given device
    async fn open(&self, device_id: &str) -> Result<Box<dyn Link>, ConnectionError>;
}

/// An open bidirectional byte stream to an adapter
#[async_trait]
pub trait Link: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Next chunk of bytes from the adapter
    ///
    /// Returns `TransportError::LinkLost` once the peer is gone; the stream
    /// cannot be resumed without reopening.
    async fn read_chunk(&mut self) -> Result<Vec<u8>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Clears a shared flag when dropped
#[derive(Debug)]
pub(crate) struct FlagGuard(Arc<AtomicBool>);

impl FlagGuard {
    pub(crate) fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlagGuard(flag.clone()))
    }
}

impl Drop for FlagGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Engine-side wrapper around a transport backend
#[derive(Clone)]
pub struct TransportAdapter {
    backend: Arc<dyn Transport>,
    open: Arc<AtomicBool>,
    scanning: Arc<AtomicBool>,
    max_frame_bytes: usize,
}

impl TransportAdapter {
    pub fn new(backend: Arc<dyn Transport>) -> Self {
        Self {
            backend,
            open: Arc::new(AtomicBool::new(false)),
            scanning: Arc::new(AtomicBool::new(false)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Set the response size ceiling used by connections opened from here
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub async fn is_available(&self) -> bool {
        self.backend.is_available().await
    }

    /// Whether a connection from this adapter is currently open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Start a deduplicated scan that ends after `duration`
    pub async fn scan(&self, duration: Duration) -> Result<DeviceScan, ConnectionError> {
        let guard = FlagGuard::acquire(&self.scanning).ok_or(ConnectionError::ScanInProgress)?;

        if !self.backend.is_available().await {
            return Err(ConnectionError::Unavailable("transport is powered off".to_string()));
        }

        let advertisements = self.backend.start_scan().await?;
        info!("Scanning for adapters for {}ms", duration.as_millis());
        Ok(DeviceScan::new(advertisements, duration, guard))
    }

    /// Open a connection, failing if one is already open
    pub async fn open(
        &self,
        device_id: &str,
        timeout: Duration,
    ) -> Result<Connection, ConnectionError> {
        let lease = FlagGuard::acquire(&self.open).ok_or(ConnectionError::AlreadyConnected)?;
        debug!("Connection {:?} -> {:?}", ConnectionState::Idle, ConnectionState::Connecting);

        let link = match tokio::time::timeout(timeout, self.backend.open(device_id)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                warn!("Opening {} failed: {}", device_id, e);
                return Err(e);
            }
            Err(_) => {
                warn!("Opening {} timed out", device_id);
                return Err(ConnectionError::Timeout(timeout.as_millis() as u64));
            }
        };

        info!("Link open to {}", device_id);
        Ok(Connection::new(device_id, link, self.max_frame_bytes, lease))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedTransport;

    #[tokio::test]
    async fn test_second_open_is_rejected() {
        let adapter = TransportAdapter::new(Arc::new(SimulatedTransport::default()));

        let mut first = adapter
            .open("sim-001", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(adapter.is_open());

        let second = adapter.open("sim-001", Duration::from_secs(1)).await;
        assert_eq!(second.err(), Some(ConnectionError::AlreadyConnected));

        first.close().await;
        assert!(!adapter.is_open());
        assert!(adapter.open("sim-001", Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_device_releases_lease() {
        let adapter = TransportAdapter::new(Arc::new(SimulatedTransport::default()));

        let result = adapter.open("nope", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ConnectionError::NotFound(_))));
        assert!(!adapter.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout() {
        let sim = SimulatedTransport::default().with_open_delay(Duration::from_secs(30));
        let adapter = TransportAdapter::new(Arc::new(sim));

        let result = adapter.open("sim-001", Duration::from_secs(5)).await;
        assert_eq!(result.err(), Some(ConnectionError::Timeout(5000)));
        assert!(!adapter.is_open());
    }

    #[tokio::test]
    async fn test_scan_unavailable_transport() {
        let sim = SimulatedTransport::default().with_available(false);
        let adapter = TransportAdapter::new(Arc::new(sim));

        let result = adapter.scan(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ConnectionError::Unavailable(_))));
        // the failed attempt does not leave the scan slot taken
        assert!(!adapter.scanning.load(Ordering::Acquire));
    }
}
