//! Session State Machine
//!
//! Single authority for "is the adapter usable right now". The current state
//! lives in a watch channel so the scheduler, the poller and any consumer see
//! every transition.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

/// Lifecycle of an adapter session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    /// Ready, with the periodic snapshot task running
    Polling,
    Closing,
}

impl SessionState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Handshaking)
                | (Connecting, Disconnected)
                | (Handshaking, Ready)
                | (Handshaking, Disconnected)
                | (Ready, Polling)
                | (Polling, Ready)
                | (Ready | Polling, Closing)
                | (Ready | Polling, Disconnected)
                | (Closing, Disconnected)
        )
    }

    /// Ad-hoc requests are accepted in `Ready` and `Polling`
    pub fn accepts_requests(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Polling)
    }

    /// The session is going away or gone
    pub fn is_closed(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Invalid session transition {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

/// Owner of the session state
#[derive(Debug)]
pub struct SessionStateMachine {
    tx: watch::Sender<SessionState>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Disconnected);
        Self { tx }
    }

    pub fn state(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Receiver that observes every subsequent transition
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move to `to`, returning the state that was left
    pub fn transition(&self, to: SessionState) -> Result<SessionState, SessionError> {
        let mut outcome = Ok(to);
        self.tx.send_if_modified(|state| {
            let from = *state;
            if from.can_transition_to(to) {
                *state = to;
                outcome = Ok(from);
                true
            } else {
                outcome = Err(SessionError::InvalidTransition { from, to });
                false
            }
        });

        match &outcome {
            Ok(from) => info!("Session {} -> {}", from, to),
            Err(e) => debug!("{}", e),
        }
        outcome
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
