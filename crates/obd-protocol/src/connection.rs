//! Adapter Connection
//!
//! Owns an open link plus the framer state for it. Exactly one command is
//! written per exchange; the caller decides what to do with the response.

use crate::error::{ExchangeError, TransportError};
use crate::framer::{self, Framer, RawFrame};
use crate::protocol::Command;
use crate::transport::{FlagGuard, Link};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Exclusive handle to an open adapter link
pub struct Connection {
    device_id: String,
    link: Box<dyn Link>,
    framer: Framer,
    state: ConnectionState,
    /// Held while open; releases the single-connection slot on close/drop
    lease: Option<FlagGuard>,
}

impl Connection {
    pub(crate) fn new(
        device_id: &str,
        link: Box<dyn Link>,
        max_frame_bytes: usize,
        lease: FlagGuard,
    ) -> Self {
        debug!("Connection {:?} -> {:?}", ConnectionState::Connecting, ConnectionState::Open);
        Self {
            device_id: device_id.to_string(),
            link,
            framer: Framer::new(max_frame_bytes),
            state: ConnectionState::Open,
            lease: Some(lease),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Write one command, dropping any unread bytes from earlier exchanges
    pub async fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let stale = self.framer.clear();
        if stale > 0 {
            debug!("Discarding {} stale bytes before {}", stale, command);
        }

        self.framer.expect_echo(command);
        self.link.write(&framer::encode(command)).await
    }

    /// Read until the next complete frame
    pub async fn read_frame(&mut self) -> Result<RawFrame, ExchangeError> {
        loop {
            if let Some(frame) = self.framer.next_frame() {
                return frame.map_err(ExchangeError::from);
            }
            if !self.is_open() {
                return Err(TransportError::Closed.into());
            }
            let chunk = self.link.read_chunk().await?;
            self.framer.push(&chunk);
        }
    }

    /// Send a command and wait for its response
    pub async fn transact(
        &mut self,
        command: &Command,
        timeout: Duration,
    ) -> Result<RawFrame, ExchangeError> {
        self.transact_matching(command, timeout, |_| true).await
    }

    /// Send a command and wait for the first frame `accept` recognises
    ///
    /// Frames rejected by `accept` are late answers to earlier commands and
    /// are dropped. The timeout covers the whole wait, not each frame.
    pub async fn transact_matching<F>(
        &mut self,
        command: &Command,
        timeout: Duration,
        accept: F,
    ) -> Result<RawFrame, ExchangeError>
    where
        F: Fn(&RawFrame) -> bool + Send,
    {
        self.send(command).await?;
        let deadline = Instant::now() + timeout;

        loop {
            match tokio::time::timeout_at(deadline, self.read_frame()).await {
                Err(_) => return Err(ExchangeError::Timeout(timeout.as_millis() as u64)),
                Ok(Ok(frame)) if accept(&frame) => return Ok(frame),
                Ok(Ok(frame)) => {
                    debug!("Dropping unrelated frame for {}: {}", command, frame.text())
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Close the link and release the connection slot
    pub async fn close(&mut self) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }

        self.state = ConnectionState::Closing;
        if let Err(e) = self.link.close().await {
            warn!("Error closing link to {}: {}", self.device_id, e);
        }
        self.framer.clear();
        self.state = ConnectionState::Closed;
        self.lease = None;
        info!("Connection to {} closed", self.device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionError;
    use crate::sim::{SimulatedTransport, SimResponse};
    use crate::transport::TransportAdapter;
    use std::sync::Arc;

    async fn open(sim: SimulatedTransport) -> Connection {
        TransportAdapter::new(Arc::new(sim))
            .open("sim-001", Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_transact_with_echo() {
        let mut conn = open(SimulatedTransport::default()).await;

        let frame = conn
            .transact(&Command::at("ATZ"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(frame.lines(), &["ELM327 v1.5".to_string()]);
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_transact_split_chunks() {
        let sim = SimulatedTransport::default().with_chunk_size(3);
        let mut conn = open(sim).await;

        let cmd = Command::Obd { mode: 0x01, pid: Some(0x0C) };
        let frame = conn.transact(&cmd, Duration::from_secs(2)).await.unwrap();
        assert_eq!(frame.hex_lines(), vec![vec![0x41, 0x0C, 0x1A, 0xF8]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_adapter_times_out() {
        let sim = SimulatedTransport::default().with_response("010D", SimResponse::Silent);
        let mut conn = open(sim).await;

        let cmd = Command::Obd { mode: 0x01, pid: Some(0x0D) };
        let result = conn.transact(&cmd, Duration::from_millis(300)).await;
        assert_eq!(result, Err(ExchangeError::Timeout(300)));
    }

    #[tokio::test]
    async fn test_unrelated_frames_dropped() {
        let mut conn = open(SimulatedTransport::default()).await;
        let cmd = Command::Obd { mode: 0x01, pid: Some(0x0D) };

        // ask for speed but only accept an RPM answer: nothing qualifies
        let result = conn
            .transact_matching(&cmd, Duration::from_millis(100), |f| f.text().starts_with("41 0C"))
            .await;
        assert!(matches!(result, Err(ExchangeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_link_loss_surfaces() {
        let sim = SimulatedTransport::default();
        let control = sim.control();
        let mut conn = open(sim).await;

        control.drop_link();
        let result = conn
            .transact(&Command::at("ATE0"), Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(ExchangeError::Link(TransportError::LinkLost)));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_writes() {
        let sim = SimulatedTransport::default();
        let adapter = TransportAdapter::new(Arc::new(sim));
        let mut conn = adapter.open("sim-001", Duration::from_secs(1)).await.unwrap();

        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(
            conn.send(&Command::at("ATZ")).await,
            Err(TransportError::Closed)
        );
        assert!(!matches!(
            adapter.open("sim-001", Duration::from_secs(1)).await,
            Err(ConnectionError::AlreadyConnected)
        ));
    }
}
