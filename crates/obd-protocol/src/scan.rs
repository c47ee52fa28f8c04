//! Bounded Device Discovery

use crate::transport::{Advertisement, DiscoveredDevice, FlagGuard};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Cancels a running [`DeviceScan`] from another task
#[derive(Debug, Clone)]
pub struct ScanCanceller {
    tx: Arc<watch::Sender<bool>>,
}

impl ScanCanceller {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// A lazy, time-bounded sequence of discovered adapters
///
/// Each identifier is yielded once. The sequence ends at the deadline, on
/// cancellation, or when the backend stops advertising, and cannot be
/// restarted; start a new scan instead.
pub struct DeviceScan {
    advertisements: mpsc::Receiver<Advertisement>,
    deadline: Instant,
    seen: HashSet<String>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    guard: Option<FlagGuard>,
}

impl DeviceScan {
    pub(crate) fn new(
        advertisements: mpsc::Receiver<Advertisement>,
        duration: Duration,
        guard: FlagGuard,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            advertisements,
            deadline: Instant::now() + duration,
            seen: HashSet::new(),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            guard: Some(guard),
        }
    }

    pub fn canceller(&self) -> ScanCanceller {
        ScanCanceller {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Whether the sequence has ended
    pub fn is_finished(&self) -> bool {
        self.guard.is_none()
    }

    /// Wait for the next new device
    pub async fn next(&mut self) -> Option<DiscoveredDevice> {
        while self.guard.is_some() {
            let advertisement = tokio::select! {
                biased;
                Ok(_) = self.cancel_rx.wait_for(|cancelled| *cancelled) => {
                    debug!("Scan cancelled");
                    None
                }
                _ = tokio::time::sleep_until(self.deadline) => {
                    debug!("Scan window elapsed");
                    None
                }
                advertisement = self.advertisements.recv() => advertisement,
            };

            let Some(advertisement) = advertisement else {
                self.finish();
                return None;
            };

            // Unnamed peripherals are never OBD adapters worth listing
            let Some(name) = advertisement.name.filter(|n| !n.trim().is_empty()) else {
                continue;
            };

            if self.seen.insert(advertisement.id.clone()) {
                return Some(DiscoveredDevice::new(advertisement.id, name, advertisement.rssi));
            }
        }
        None
    }

    /// Drain the scan into a list once it ends
    pub async fn collect(mut self) -> Vec<DiscoveredDevice> {
        let mut devices = Vec::new();
        while let Some(device) = self.next().await {
            devices.push(device);
        }
        info!("Scan finished with {} device(s)", devices.len());
        devices
    }

    fn finish(&mut self) {
        self.advertisements.close();
        self.guard = None;
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ConnectionError;
    use crate::sim::SimulatedTransport;
    use crate::transport::{DiscoveredDevice, TransportAdapter};
    use std::sync::Arc;
    use std::time::Duration;

    fn adapter() -> TransportAdapter {
        TransportAdapter::new(Arc::new(SimulatedTransport::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_deduplicates_and_skips_unnamed() {
        let sim = SimulatedTransport::default()
            .with_devices(vec![
                DiscoveredDevice::new("sim-001", "OBD2 Simulator", Some(-60)),
                DiscoveredDevice::new("sim-002", "ELM327 Bluetooth", None),
                DiscoveredDevice::new("sim-003", "", Some(-80)),
            ]);
        let adapter = TransportAdapter::new(Arc::new(sim));

        let scan = adapter.scan(Duration::from_secs(2)).await.unwrap();
        let devices = scan.collect().await;

        let ids: Vec<_> = devices.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["sim-001", "sim-002"]);
        assert_eq!(devices[0].rssi(), Some(-60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_scan_fails_fast() {
        let adapter = adapter();

        let scan = adapter.scan(Duration::from_secs(2)).await.unwrap();
        let second = adapter.scan(Duration::from_secs(2)).await;
        assert!(matches!(second, Err(ConnectionError::ScanInProgress)));

        scan.collect().await;
        assert!(adapter.scan(Duration::from_secs(2)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_scan() {
        let adapter = adapter();

        let mut scan = adapter.scan(Duration::from_secs(60)).await.unwrap();
        let canceller = scan.canceller();
        assert!(scan.next().await.is_some());

        canceller.cancel();
        assert!(scan.next().await.is_none());
        assert!(scan.is_finished());
        assert!(scan.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_ends_at_deadline() {
        // simulator keeps re-advertising for much longer than the window
        let sim = SimulatedTransport::default().with_advertise_rounds(1000);
        let adapter = TransportAdapter::new(Arc::new(sim));

        let started = tokio::time::Instant::now();
        let devices = adapter
            .scan(Duration::from_millis(500))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(devices.len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(600));
    }
}
