//! Diagnostic Engine
//!
//! The one object a UI talks to. It owns the transport, the session state and
//! the active session; nothing is global, so several engines (one per
//! adapter) can coexist.

use crate::config::EngineConfig;
use crate::error::{ClearError, ConnectError, TroubleCodeError};
use crate::poller::Poller;
use crate::session::{self, Session, SessionInfo};
use crate::snapshot::{self, VehicleSnapshot};
use obd_protocol::{
    decode_trouble_codes, is_clear_acknowledged, ConnectionError, DeviceScan, DiscoveredDevice,
    RawFrame, Transport, TransportAdapter, TroubleCode,
};
use obd_scheduler::{
    PidRequest, RequestError, SchedulerHandle, SessionError, SessionState, SessionStateMachine,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// What the engine holds for its adapter
enum Slot {
    Empty,
    /// A connect attempt is running; sending on (or dropping) this aborts it
    Connecting(oneshot::Sender<()>),
    Active(Session),
}

impl Slot {
    fn active(&self) -> Option<&Session> {
        match self {
            Slot::Active(session) => Some(session),
            _ => None,
        }
    }

    fn active_mut(&mut self) -> Option<&mut Session> {
        match self {
            Slot::Active(session) => Some(session),
            _ => None,
        }
    }
}

/// Whether the connect attempt owning `cancel` is still wanted
fn attempt_alive(cancel: &mut oneshot::Receiver<()>) -> bool {
    matches!(cancel.try_recv(), Err(TryRecvError::Empty))
}

/// Diagnostic engine for one adapter at a time
pub struct DiagnosticEngine {
    transport: TransportAdapter,
    config: EngineConfig,
    machine: Arc<SessionStateMachine>,
    slot: Mutex<Slot>,
}

impl DiagnosticEngine {
    /// Create an engine on top of a transport backend
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        let transport =
            TransportAdapter::new(transport).with_max_frame_bytes(config.scheduler.max_frame_bytes);
        Self {
            transport,
            config,
            machine: Arc::new(SessionStateMachine::new()),
            slot: Mutex::new(Slot::Empty),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether the radio or port service behind the transport is usable
    pub async fn is_transport_available(&self) -> bool {
        self.transport.is_available().await
    }

    /// Scan for `duration` and return everything found
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, ConnectionError> {
        Ok(self.transport.scan(duration).await?.collect().await)
    }

    /// Scan lazily, yielding devices as they are discovered
    pub async fn scan_devices(&self, duration: Duration) -> Result<DeviceScan, ConnectionError> {
        self.transport.scan(duration).await
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.machine.subscribe()
    }

    /// Details of the live session, if any
    pub async fn session_info(&self) -> Option<SessionInfo> {
        if !self.state().accepts_requests() {
            return None;
        }
        self.slot.lock().await.active().map(|s| s.info.clone())
    }

    /// Open the adapter and run the handshake
    ///
    /// The engine lock is only held to reserve and to install the session, so
    /// requests fail fast with `SessionNotReady` meanwhile and `disconnect`
    /// can abort the attempt.
    pub async fn connect(&self, device_id: &str) -> Result<SessionInfo, ConnectError> {
        let mut cancel = self.reserve().await?;

        let opened = tokio::select! {
            biased;
            _ = &mut cancel => None,
            result = self.transport.open(device_id, self.config.connect_timeout()) => Some(result),
        };
        let mut connection = match opened {
            Some(Ok(connection)) => connection,
            Some(Err(e)) => {
                self.fail_attempt(&mut cancel).await;
                return Err(e.into());
            }
            None => return Err(ConnectError::Aborted),
        };

        {
            let _slot = self.slot.lock().await;
            if attempt_alive(&mut cancel) {
                self.advance(SessionState::Handshaking);
            }
        }

        let handshake = tokio::select! {
            biased;
            _ = &mut cancel => None,
            result = session::handshake(&mut connection, &self.config.handshake) => Some(result),
        };
        let info = match handshake {
            Some(Ok(info)) => info,
            Some(Err(e)) => {
                warn!("{}", e);
                connection.close().await;
                self.fail_attempt(&mut cancel).await;
                return Err(e.into());
            }
            None => {
                connection.close().await;
                return Err(ConnectError::Aborted);
            }
        };

        let mut slot = self.slot.lock().await;
        if !attempt_alive(&mut cancel) {
            drop(slot);
            connection.close().await;
            return Err(ConnectError::Aborted);
        }

        let session = Session::start(
            connection,
            info.clone(),
            &self.config.scheduler,
            self.machine.clone(),
        );
        *slot = Slot::Active(session);
        self.advance(SessionState::Ready);

        info!("Connected to {} ({})", info.device_id, info.adapter);
        Ok(info)
    }

    /// Claim the slot for a new connect attempt
    async fn reserve(&self) -> Result<oneshot::Receiver<()>, ConnectError> {
        let mut slot = self.slot.lock().await;

        let busy = match &*slot {
            Slot::Empty => false,
            Slot::Connecting(_) => true,
            Slot::Active(_) => !self.state().is_closed(),
        };
        if busy {
            return Err(ConnectionError::AlreadyConnected.into());
        }
        if let Slot::Active(stale) = std::mem::replace(&mut *slot, Slot::Empty) {
            debug!("Cleaning up session to {}", stale.info.device_id);
            stale.shutdown().await;
        }

        self.machine
            .transition(SessionState::Connecting)
            .map_err(|_| ConnectionError::AlreadyConnected)?;

        let (tx, rx) = oneshot::channel();
        *slot = Slot::Connecting(tx);
        Ok(rx)
    }

    /// Release the slot after a failed attempt, unless it was already aborted
    async fn fail_attempt(&self, cancel: &mut oneshot::Receiver<()>) {
        let mut slot = self.slot.lock().await;
        if attempt_alive(cancel) {
            *slot = Slot::Empty;
            self.mark_disconnected();
        }
    }

    /// Close the session, failing anything still pending with `SessionClosed`
    ///
    /// A connect that has not finished yet is aborted.
    pub async fn disconnect(&self) {
        let mut slot = self.slot.lock().await;
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Empty => debug!("Disconnect with no session"),
            Slot::Connecting(cancel) => {
                let _ = cancel.send(());
                self.mark_disconnected();
                info!("Connect attempt aborted");
            }
            Slot::Active(session) => {
                let closing = self.machine.transition(SessionState::Closing).is_ok();
                session.shutdown().await;
                if closing {
                    self.advance(SessionState::Disconnected);
                }
                info!("Disconnected");
            }
        }
    }

    /// Read the current live data
    pub async fn read_snapshot(&self) -> Result<VehicleSnapshot, RequestError> {
        let scheduler = self.scheduler().await?;
        snapshot::capture(&scheduler, self.state()).await
    }

    /// Read stored trouble codes (service 03)
    pub async fn read_trouble_codes(&self) -> Result<Vec<TroubleCode>, TroubleCodeError> {
        let frame = self.send_command(PidRequest::stored_codes()).await?;
        let codes = decode_trouble_codes(&frame).map_err(|e| {
            warn!("Trouble code response could not be decoded: {}", e);
            e
        })?;
        info!("{} stored trouble code(s)", codes.len());
        Ok(codes)
    }

    /// Clear stored trouble codes (service 04)
    pub async fn clear_trouble_codes(&self) -> Result<(), ClearError> {
        let frame = self.send_command(PidRequest::clear_codes()).await?;
        if is_clear_acknowledged(&frame) {
            info!("Trouble codes cleared");
            Ok(())
        } else {
            Err(ClearError::Unexpected(frame.text()))
        }
    }

    /// Send a raw request through the scheduler
    pub async fn send_command(&self, request: PidRequest) -> Result<RawFrame, RequestError> {
        self.scheduler().await?.submit(request).await
    }

    /// Start periodic snapshots, delivered on the returned channel
    pub async fn start_polling(&self) -> Result<mpsc::Receiver<VehicleSnapshot>, SessionError> {
        let mut slot = self.slot.lock().await;
        let Some(session) = slot.active_mut() else {
            return Err(SessionError::InvalidTransition {
                from: self.state(),
                to: SessionState::Polling,
            });
        };

        self.machine.transition(SessionState::Polling)?;

        let polling = &self.config.polling;
        let (tx, rx) = mpsc::channel(polling.channel_capacity.max(1));
        session.poller = Some(Poller::spawn(
            session.scheduler.clone(),
            self.machine.subscribe(),
            polling.interval(),
            tx,
        ));
        Ok(rx)
    }

    /// Stop periodic snapshots and return to `Ready`
    pub async fn stop_polling(&self) -> Result<(), SessionError> {
        let mut slot = self.slot.lock().await;
        self.machine.transition(SessionState::Ready)?;

        if let Some(poller) = slot.active_mut().and_then(|s| s.poller.take()) {
            poller.join().await;
        }
        Ok(())
    }

    async fn scheduler(&self) -> Result<SchedulerHandle, RequestError> {
        if !self.state().accepts_requests() {
            return Err(RequestError::SessionNotReady);
        }
        self.slot
            .lock()
            .await
            .active()
            .map(|s| s.scheduler.clone())
            .ok_or(RequestError::SessionNotReady)
    }

    /// Transition that cannot be rejected given the caller holds the slot lock
    fn advance(&self, to: SessionState) {
        if let Err(e) = self.machine.transition(to) {
            warn!("{}", e);
        }
    }

    fn mark_disconnected(&self) {
        self.advance(SessionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HandshakeCause, HandshakeStep};
    use obd_protocol::{SimControl, SimResponse, SimulatedTransport};
    use obd_scheduler::SchedulerConfig;

    fn engine(sim: SimulatedTransport) -> (Arc<DiagnosticEngine>, SimControl) {
        engine_with(sim, EngineConfig::default())
    }

    fn engine_with(
        sim: SimulatedTransport,
        config: EngineConfig,
    ) -> (Arc<DiagnosticEngine>, SimControl) {
        let control = sim.control();
        (Arc::new(DiagnosticEngine::new(Arc::new(sim), config)), control)
    }

    async fn wait_for_state(engine: &DiagnosticEngine, state: SessionState) {
        let mut rx = engine.subscribe_state();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_lists_devices() {
        let (engine, _) = engine(SimulatedTransport::default());
        assert!(engine.is_transport_available().await);

        let devices = engine.scan(Duration::from_secs(1)).await.unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].name(), "OBD2 Simulator");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_unavailable_transport() {
        let (engine, _) = engine(SimulatedTransport::default().with_available(false));
        assert!(matches!(
            engine.scan(Duration::from_secs(1)).await,
            Err(ConnectionError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reaches_ready() {
        let (engine, control) = engine(SimulatedTransport::default());

        let info = engine.connect("sim-001").await.unwrap();
        assert_eq!(info.adapter, "ELM327 v1.5");
        assert_eq!(engine.state(), SessionState::Ready);
        assert_eq!(engine.session_info().await, Some(info));
        assert_eq!(control.writes(), vec!["ATZ", "ATE0", "ATSP0", "ATL0"]);

        engine.disconnect().await;
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert_eq!(engine.session_info().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_handshake_step_disconnects() {
        let sim = SimulatedTransport::default().with_response("ATE0", SimResponse::Silent);
        let (engine, control) = engine(sim);

        let err = engine.connect("sim-001").await.unwrap_err();
        match err {
            ConnectError::Handshake(e) => {
                assert_eq!(e.step, HandshakeStep::EchoOff);
                assert_eq!(e.cause, HandshakeCause::Timeout);
                assert_eq!(e.attempts, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert_eq!(control.count("ATE0"), 3);

        // the connection slot was released
        control.set_response("ATE0", SimResponse::Reply("OK".to_string()));
        assert!(engine.connect("sim-001").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_errors() {
        let (engine, _) = engine(SimulatedTransport::default());

        assert!(matches!(
            engine.connect("nope").await,
            Err(ConnectError::Connection(ConnectionError::NotFound(_)))
        ));
        assert_eq!(engine.state(), SessionState::Disconnected);

        engine.connect("sim-001").await.unwrap();
        assert_eq!(
            engine.connect("sim-002").await,
            Err(ConnectError::Connection(ConnectionError::AlreadyConnected))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let sim = SimulatedTransport::default().with_open_delay(Duration::from_secs(30));
        let (engine, _) = engine(sim);

        assert_eq!(
            engine.connect("sim-001").await,
            Err(ConnectError::Connection(ConnectionError::Timeout(10_000)))
        );
        assert_eq!(engine.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_need_a_session() {
        let (engine, _) = engine(SimulatedTransport::default());
        assert_eq!(engine.read_snapshot().await, Err(RequestError::SessionNotReady));
        assert_eq!(
            engine.read_trouble_codes().await,
            Err(TroubleCodeError::Request(RequestError::SessionNotReady))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_rejected_during_handshake() {
        let sim = SimulatedTransport::default().with_latency(Duration::from_millis(500));
        let (engine, _) = engine(sim);

        let connecting = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.connect("sim-001").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!engine.state().accepts_requests());

        let started = tokio::time::Instant::now();
        assert_eq!(
            engine.send_command(PidRequest::live_data(0x0D)).await,
            Err(RequestError::SessionNotReady)
        );
        assert_eq!(engine.read_snapshot().await, Err(RequestError::SessionNotReady));
        assert_eq!(started.elapsed(), Duration::ZERO);

        assert!(connecting.await.unwrap().is_ok());
        assert!(engine.send_command(PidRequest::live_data(0x0D)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_aborts_connect() {
        let sim = SimulatedTransport::default().with_latency(Duration::from_millis(500));
        let (engine, _) = engine(sim);

        let connecting = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.connect("sim-001").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        engine.disconnect().await;
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert_eq!(connecting.await.unwrap(), Err(ConnectError::Aborted));
        assert_eq!(engine.state(), SessionState::Disconnected);

        // the aborted attempt released the adapter
        assert!(engine.connect("sim-001").await.is_ok());
        assert_eq!(engine.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_decodes_live_data() {
        let (engine, _) = engine(SimulatedTransport::default());
        engine.connect("sim-001").await.unwrap();

        let snapshot = engine.read_snapshot().await.unwrap();
        assert_eq!(snapshot.speed_kmh(), Some(40.0));
        assert_eq!(snapshot.rpm(), Some(1726.0));
        assert_eq!(snapshot.coolant_temp_c(), Some(83.0));
        assert_eq!(snapshot.intake_air_temp_c(), Some(16.0));
        assert!((snapshot.engine_load_pct().unwrap() - 39.2).abs() < 0.1);
        assert!((snapshot.throttle_pct().unwrap() - 27.1).abs() < 0.1);
        assert!((snapshot.fuel_level_pct().unwrap() - 50.2).abs() < 0.1);
        assert_eq!(snapshot.session_state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data_leaves_field_absent() {
        let sim = SimulatedTransport::default()
            .with_response("010C", SimResponse::Reply("NO DATA".to_string()));
        let (engine, _) = engine(sim);
        engine.connect("sim-001").await.unwrap();

        let snapshot = engine.read_snapshot().await.unwrap();
        assert_eq!(snapshot.rpm(), None);
        assert_eq!(snapshot.speed_kmh(), Some(40.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbled_pid_leaves_field_absent() {
        let sim = SimulatedTransport::default()
            .with_response("0105", SimResponse::Reply("41 05".to_string()));
        let (engine, _) = engine(sim);
        engine.connect("sim-001").await.unwrap();

        let snapshot = engine.read_snapshot().await.unwrap();
        assert_eq!(snapshot.coolant_temp_c(), None);
        assert_eq!(snapshot.rpm(), Some(1726.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_and_clear_trouble_codes() {
        let (engine, _) = engine(SimulatedTransport::default());
        engine.connect("sim-001").await.unwrap();

        let codes: Vec<_> = engine
            .read_trouble_codes()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.code)
            .collect();
        assert_eq!(codes, vec!["P0100", "C0200"]);

        engine.clear_trouble_codes().await.unwrap();
        assert!(engine.read_trouble_codes().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_line_before_codes() {
        let sim = SimulatedTransport::default().with_response(
            "03",
            SimResponse::Reply("BUS INIT: ...OK\r43 01 00 03 01 00 00".to_string()),
        );
        let (engine, _) = engine(sim);
        engine.connect("sim-001").await.unwrap();

        let codes: Vec<_> = engine
            .read_trouble_codes()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.code)
            .collect();
        assert_eq!(codes, vec!["P0100", "P0301"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_codes_are_an_error() {
        let sim = SimulatedTransport::default()
            .with_response("03", SimResponse::Reply("BUS INIT: ...OK".to_string()));
        let (engine, _) = engine(sim);
        engine.connect("sim-001").await.unwrap();

        assert!(matches!(
            engine.read_trouble_codes().await,
            Err(TroubleCodeError::Undecodable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_rejected() {
        let sim = SimulatedTransport::default()
            .with_response("04", SimResponse::Reply("?".to_string()));
        let (engine, _) = engine(sim);
        engine.connect("sim-001").await.unwrap();

        assert_eq!(
            engine.clear_trouble_codes().await,
            Err(ClearError::Unexpected("?".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_command() {
        let (engine, _) = engine(SimulatedTransport::default());
        engine.connect("sim-001").await.unwrap();

        let frame = engine.send_command(PidRequest::live_data(0x00)).await.unwrap();
        assert_eq!(frame.text(), "41 00 BE 3F A8 13");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_flight() {
        let sim = SimulatedTransport::default().with_response("010C", SimResponse::Silent);
        let config = EngineConfig {
            scheduler: SchedulerConfig {
                request_timeout_ms: 5000,
                ..Default::default()
            },
            ..Default::default()
        };
        let (engine, _) = engine_with(sim, config);
        engine.connect("sim-001").await.unwrap();

        let reader = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.read_snapshot().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        engine.disconnect().await;
        assert_eq!(reader.await.unwrap(), Err(RequestError::SessionClosed));
        assert_eq!(engine.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_link_loss_forces_disconnected() {
        let (engine, control) = engine(SimulatedTransport::default());
        engine.connect("sim-001").await.unwrap();

        control.drop_link();
        wait_for_state(&engine, SessionState::Disconnected).await;
        assert_eq!(engine.read_snapshot().await, Err(RequestError::SessionNotReady));

        // reconnecting re-handshakes on a fresh link
        engine.connect("sim-001").await.unwrap();
        assert_eq!(engine.state(), SessionState::Ready);
        assert!(engine.read_snapshot().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_noise_in_reply_keeps_session_usable() {
        let sim = SimulatedTransport::default()
            .with_response("010C", SimResponse::Reply("41 0C 4\u{e9}1".to_string()));
        let (engine, _) = engine(sim);
        engine.connect("sim-001").await.unwrap();

        assert_eq!(
            engine.send_command(PidRequest::live_data(0x0C)).await,
            Err(RequestError::Timeout { attempts: 3 })
        );
        assert_eq!(engine.state(), SessionState::Ready);

        let frame = engine.send_command(PidRequest::live_data(0x0D)).await.unwrap();
        assert_eq!(frame.text(), "41 0D 28");
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_cycle() {
        let (engine, _) = engine(SimulatedTransport::default());
        engine.connect("sim-001").await.unwrap();

        let mut snapshots = engine.start_polling().await.unwrap();
        assert_eq!(engine.state(), SessionState::Polling);

        let first = snapshots.recv().await.unwrap();
        let second = snapshots.recv().await.unwrap();
        assert_eq!(first.session_state(), SessionState::Polling);
        assert_eq!(second.rpm(), Some(1726.0));

        // ad-hoc requests still go through while polling
        assert_eq!(engine.read_trouble_codes().await.unwrap().len(), 2);

        engine.stop_polling().await.unwrap();
        assert_eq!(engine.state(), SessionState::Ready);
        assert!(engine.stop_polling().await.is_err());

        engine.disconnect().await;
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert!(snapshots.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_polling() {
        let (engine, _) = engine(SimulatedTransport::default());
        engine.connect("sim-001").await.unwrap();
        let mut snapshots = engine.start_polling().await.unwrap();
        snapshots.recv().await.unwrap();

        engine.disconnect().await;
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert!(snapshots.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_requires_session() {
        let (engine, _) = engine(SimulatedTransport::default());
        assert!(engine.start_polling().await.is_err());
        assert_eq!(engine.state(), SessionState::Disconnected);
    }
}
