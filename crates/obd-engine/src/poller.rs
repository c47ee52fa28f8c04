//! Periodic Snapshot Polling
//!
//! Goes through the same scheduler queue as every other request; it never
//! talks to the adapter directly.

use crate::snapshot::{self, VehicleSnapshot};
use obd_scheduler::{RequestError, SchedulerHandle, SessionState};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle to a running poll task
pub(crate) struct Poller {
    task: JoinHandle<()>,
}

impl Poller {
    /// Start polling; the session must already be `Polling`
    ///
    /// The task stops by itself once the state leaves `Polling`.
    pub fn spawn(
        scheduler: SchedulerHandle,
        state: watch::Receiver<SessionState>,
        interval: Duration,
        tx: mpsc::Sender<VehicleSnapshot>,
    ) -> Self {
        let task = tokio::spawn(run(scheduler, state, interval, tx));
        Self { task }
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Poll task ended abnormally: {}", e);
        }
    }
}

async fn left_polling(state: &mut watch::Receiver<SessionState>) {
    let _ = state.wait_for(|s| *s != SessionState::Polling).await;
}

async fn run(
    scheduler: SchedulerHandle,
    mut state: watch::Receiver<SessionState>,
    interval: Duration,
    tx: mpsc::Sender<VehicleSnapshot>,
) {
    info!("Polling every {}ms", interval.as_millis());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = left_polling(&mut state) => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = left_polling(&mut state) => break,
            result = snapshot::capture(&scheduler, SessionState::Polling) => result,
        };

        match result {
            Ok(snapshot) => match tx.try_send(snapshot) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Snapshot consumer lagging, dropping snapshot");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Snapshot receiver dropped");
                    break;
                }
            },
            Err(e @ (RequestError::SessionClosed | RequestError::SessionNotReady)) => {
                debug!("Polling ended: {}", e);
                break;
            }
            Err(e) => warn!("Poll cycle failed: {}", e),
        }
    }

    info!("Polling stopped");
}
