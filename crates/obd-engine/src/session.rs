//! Adapter Session
//!
//! A session starts once the link is open: the ELM327 handshake runs directly
//! on the connection, then the connection is handed to the scheduler actor
//! for the rest of its life.

use crate::config::HandshakeConfig;
use crate::error::{HandshakeCause, HandshakeError, HandshakeStep};
use crate::poller::Poller;
use obd_protocol::{at, Command, Connection, ExchangeError, ObdProtocol, RawFrame};
use obd_scheduler::{
    Scheduler, SchedulerConfig, SchedulerEvent, SchedulerHandle, SessionState, SessionStateMachine,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What the handshake established about the adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub device_id: String,
    /// Identification string returned by `ATZ`, e.g. `ELM327 v1.5`
    pub adapter: String,
    pub protocol: ObdProtocol,
    pub echo_off: bool,
    pub linefeeds_off: bool,
}

/// Bring a freshly opened adapter into a known state
///
/// `ATZ`, `ATE0` and `ATSPn` must all succeed; `ATL0` is best effort.
pub(crate) async fn handshake(
    connection: &mut Connection,
    config: &HandshakeConfig,
) -> Result<SessionInfo, HandshakeError> {
    let adapter =
        run_step(connection, HandshakeStep::Reset, at::RESET, config, identification).await?;
    info!("Adapter identified as {}", adapter);

    run_step(connection, HandshakeStep::EchoOff, at::ECHO_OFF, config, acknowledged).await?;

    let protocol = config.protocol;
    run_step(
        connection,
        HandshakeStep::SetProtocol,
        protocol.to_elm_command(),
        config,
        acknowledged,
    )
    .await?;

    let linefeeds_off = match connection
        .transact(&Command::at(at::LINEFEEDS_OFF), config.step_timeout())
        .await
    {
        Ok(frame) if frame.is_ok() => true,
        Ok(frame) => {
            warn!("{} answered {:?}, keeping line feeds", at::LINEFEEDS_OFF, frame.text());
            false
        }
        Err(e) => {
            warn!("{} failed: {}", at::LINEFEEDS_OFF, e);
            false
        }
    };

    Ok(SessionInfo {
        device_id: connection.device_id().to_string(),
        adapter,
        protocol,
        echo_off: true,
        linefeeds_off,
    })
}

fn identification(frame: &RawFrame) -> Option<String> {
    frame
        .lines()
        .iter()
        .rev()
        .find(|line| line.as_str() != "?" && line.as_str() != "OK")
        .cloned()
}

fn acknowledged(frame: &RawFrame) -> Option<()> {
    frame.is_ok().then_some(())
}

async fn run_step<T>(
    connection: &mut Connection,
    step: HandshakeStep,
    text: &str,
    config: &HandshakeConfig,
    check: impl Fn(&RawFrame) -> Option<T>,
) -> Result<T, HandshakeError> {
    let command = Command::at(text);
    let attempts = config.retries + 1;
    let mut cause = HandshakeCause::Timeout;

    for attempt in 1..=attempts {
        debug!("Handshake {} ({}) attempt {}/{}", step, command, attempt, attempts);
        match connection.transact(&command, config.step_timeout()).await {
            Ok(frame) => match check(&frame) {
                Some(value) => return Ok(value),
                None => {
                    warn!("Handshake {} got {:?}", step, frame.text());
                    cause = HandshakeCause::Unexpected(frame.text());
                }
            },
            Err(ExchangeError::Timeout(ms)) => {
                warn!("Handshake {} timed out after {}ms", step, ms);
                cause = HandshakeCause::Timeout;
            }
            Err(ExchangeError::Framing(e)) => {
                warn!("Handshake {} got a corrupt response: {}", step, e);
                cause = HandshakeCause::Framing;
            }
            Err(ExchangeError::Link(e)) => {
                warn!("Handshake {} lost the link: {}", step, e);
                return Err(HandshakeError {
                    step,
                    attempts: attempt,
                    cause: HandshakeCause::Link,
                });
            }
        }
    }

    Err(HandshakeError {
        step,
        attempts,
        cause,
    })
}

/// Everything that lives exactly as long as one adapter session
pub(crate) struct Session {
    pub info: SessionInfo,
    pub scheduler: SchedulerHandle,
    pub poller: Option<Poller>,
    scheduler_task: JoinHandle<()>,
    supervisor_task: JoinHandle<()>,
}

impl Session {
    /// Hand the connection to a scheduler actor and watch it for failures
    pub fn start(
        connection: Connection,
        info: SessionInfo,
        config: &SchedulerConfig,
        machine: Arc<SessionStateMachine>,
    ) -> Self {
        let (scheduler, events, scheduler_task) =
            Scheduler::spawn(connection, config.clone(), machine.subscribe());
        let supervisor_task = tokio::spawn(supervise(events, machine));

        Self {
            info,
            scheduler,
            poller: None,
            scheduler_task,
            supervisor_task,
        }
    }

    /// Wait for every session task to finish
    ///
    /// The state must already be `Closing` or `Disconnected`, which is what
    /// makes the scheduler and poller exit.
    pub async fn shutdown(mut self) {
        if let Some(poller) = self.poller.take() {
            poller.join().await;
        }
        drop(self.scheduler);
        if let Err(e) = self.scheduler_task.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
        if let Err(e) = self.supervisor_task.await {
            warn!("Supervisor task ended abnormally: {}", e);
        }
        debug!("Session for {} shut down", self.info.device_id);
    }
}

/// Force `Disconnected` when the scheduler reports it cannot go on
///
/// The event channel also closes if the scheduler task dies without a
/// report; unless the session was already closing, that is treated the same.
async fn supervise(
    mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
    machine: Arc<SessionStateMachine>,
) {
    while let Some(event) = events.recv().await {
        warn!("Session lost: {:?}", event);
        if let Err(e) = machine.transition(SessionState::Disconnected) {
            debug!("Ignoring {:?}: {}", event, e);
        }
    }

    if !machine.state().is_closed() {
        error!("Scheduler stopped without closing the session");
        if let Err(e) = machine.transition(SessionState::Disconnected) {
            warn!("{}", e);
        }
    }
}
