//! Request Scheduler Implementation
//!
//! An actor task owns the [`Connection`] and works through a FIFO queue, one
//! command at a time. Callers talk to it through a cloneable
//! [`SchedulerHandle`].

use crate::request::{PidRequest, RequestError};
use crate::state::SessionState;
use obd_protocol::{Connection, ExchangeError, FramingError, RawFrame};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration for the request scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Per-attempt response timeout in milliseconds (default: 3000)
    pub request_timeout_ms: u64,
    /// Retries after the first attempt times out (default: 2)
    pub retry_limit: u32,
    /// Requests in a row exhausting their retries before the session is
    /// declared unrecoverable
    pub max_consecutive_failures: u32,
    /// Malformed frames in a row before the session is declared unrecoverable
    pub max_framing_errors: u32,
    /// Response size ceiling for the framer
    pub max_frame_bytes: usize,
}

impl SchedulerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 3000,
            retry_limit: 2,
            max_consecutive_failures: 3,
            max_framing_errors: 3,
            max_frame_bytes: obd_protocol::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Conditions the session has to react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// The transport reported the peer gone
    LinkLost,
    /// The adapter keeps failing; the session should be torn down
    Unrecoverable { reason: String },
}

struct Job {
    request: PidRequest,
    reply: oneshot::Sender<Result<RawFrame, RequestError>>,
}

/// A request accepted into the queue
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    rx: oneshot::Receiver<Result<RawFrame, RequestError>>,
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the request to resolve
    pub async fn response(self) -> Result<RawFrame, RequestError> {
        // actor gone without replying: the session was torn down
        self.rx.await.unwrap_or(Err(RequestError::SessionClosed))
    }
}

/// Submission side of the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    jobs: mpsc::UnboundedSender<Job>,
    state: watch::Receiver<SessionState>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("request", &self.request).finish()
    }
}

impl SchedulerHandle {
    /// Queue a request without waiting for it
    pub fn enqueue(&self, mut request: PidRequest) -> Result<PendingRequest, RequestError> {
        let state = *self.state.borrow();
        if !state.accepts_requests() {
            debug!("Rejecting {} in state {}", request.command(), state);
            return Err(RequestError::SessionNotReady);
        }

        request.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        request.submitted_at = Instant::now();
        request.retries = 0;
        let id = request.id;

        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job { request, reply })
            .map_err(|_| RequestError::SessionClosed)?;
        Ok(PendingRequest { id, rx })
    }

    /// Queue a request and wait for its response
    pub async fn submit(&self, request: PidRequest) -> Result<RawFrame, RequestError> {
        self.enqueue(request)?.response().await
    }

    /// Whether the actor has stopped taking requests
    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}

/// Actor serializing every exchange on one connection
pub struct Scheduler {
    connection: Connection,
    config: SchedulerConfig,
    jobs: mpsc::UnboundedReceiver<Job>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    consecutive_failures: u32,
    framing_errors: u32,
    /// Set once the connection can no longer be used
    halted: bool,
}

impl Scheduler {
    /// Start the actor on `connection`
    ///
    /// The actor runs until the session leaves `Ready`/`Polling` for
    /// `Closing` or `Disconnected`, every handle is dropped, or the link
    /// fails. It closes the connection on the way out.
    pub fn spawn(
        connection: Connection,
        config: SchedulerConfig,
        state: watch::Receiver<SessionState>,
    ) -> (
        SchedulerHandle,
        mpsc::UnboundedReceiver<SchedulerEvent>,
        JoinHandle<()>,
    ) {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = SchedulerHandle {
            jobs: jobs_tx,
            state: state.clone(),
            next_id: Arc::new(AtomicU64::new(0)),
        };

        let scheduler = Scheduler {
            connection,
            config,
            jobs: jobs_rx,
            events: events_tx,
            consecutive_failures: 0,
            framing_errors: 0,
            halted: false,
        };
        let task = tokio::spawn(scheduler.run(state));

        (handle, events_rx, task)
    }

    async fn run(mut self, mut state: watch::Receiver<SessionState>) {
        info!("Scheduler started for {}", self.connection.device_id());

        loop {
            let job = tokio::select! {
                biased;
                _ = session_closed(&mut state) => break,
                job = self.jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                // nothing in flight: the only thing the link can report is its own loss
                idle = self.connection.read_frame() => {
                    match idle {
                        Ok(frame) => debug!("Discarding unsolicited frame: {}", frame.text()),
                        Err(ExchangeError::Link(e)) => {
                            error!("Link failed while idle: {}", e);
                            self.halt(SchedulerEvent::LinkLost);
                            break;
                        }
                        Err(e) => debug!("Discarding idle input: {}", e),
                    }
                    continue;
                }
            };

            let Job { mut request, reply } = job;
            let outcome = tokio::select! {
                biased;
                _ = session_closed(&mut state) => {
                    debug!("Request {} cancelled by session close", request.id);
                    let _ = reply.send(Err(RequestError::SessionClosed));
                    break;
                }
                outcome = self.execute(&mut request) => outcome,
            };

            debug!(
                "Request {} ({}) resolved after {:?}",
                request.id,
                request.command(),
                request.submitted_at.elapsed()
            );
            let _ = reply.send(outcome);

            if self.halted {
                break;
            }
        }

        self.shutdown().await;
    }

    /// Run one request to completion, retrying timeouts and corrupt frames
    async fn execute(&mut self, request: &mut PidRequest) -> Result<RawFrame, RequestError> {
        let command = request.command();
        let timeout = self.config.request_timeout();
        let (mode, pid) = (request.mode, request.pid);

        loop {
            metrics::counter!("obd_requests_sent_total").increment(1);
            let result = self
                .connection
                .transact_matching(&command, timeout, move |frame| mode.accepts(pid, frame))
                .await;

            let failure = match result {
                Ok(frame) => {
                    self.consecutive_failures = 0;
                    self.framing_errors = 0;
                    if let Some(token) = frame.adapter_error() {
                        metrics::counter!("obd_adapter_errors_total").increment(1);
                        warn!("Adapter answered {} with {}", command, token);
                        return Err(RequestError::AdapterError(token.to_string()));
                    }
                    return Ok(frame);
                }
                Err(ExchangeError::Link(e)) => {
                    error!("Link failed during {}: {}", command, e);
                    self.halt(SchedulerEvent::LinkLost);
                    return Err(RequestError::SessionClosed);
                }
                Err(ExchangeError::Timeout(ms)) => {
                    metrics::counter!("obd_request_timeouts_total").increment(1);
                    warn!("{} timed out after {}ms (attempt {})", command, ms, request.retries + 1);
                    None
                }
                Err(ExchangeError::Framing(e)) => {
                    self.framing_errors += 1;
                    warn!("{} got a corrupt response: {}", command, e);
                    if self.framing_errors >= self.config.max_framing_errors {
                        self.halt(SchedulerEvent::Unrecoverable {
                            reason: format!("{} malformed responses in a row", self.framing_errors),
                        });
                        return Err(RequestError::Malformed {
                            attempts: request.retries + 1,
                            source: e,
                        });
                    }
                    Some(e)
                }
            };

            if request.retries < self.config.retry_limit {
                request.retries += 1;
                metrics::counter!("obd_request_retries_total").increment(1);
                debug!("Retrying {} ({}/{})", command, request.retries, self.config.retry_limit);
                continue;
            }

            return Err(self.exhausted(request, failure));
        }
    }

    fn exhausted(&mut self, request: &PidRequest, failure: Option<FramingError>) -> RequestError {
        let attempts = request.retries + 1;
        self.consecutive_failures += 1;
        warn!(
            "Request {} ({}) failed after {} attempt(s)",
            request.id,
            request.command(),
            attempts
        );

        if self.consecutive_failures >= self.config.max_consecutive_failures {
            self.halt(SchedulerEvent::Unrecoverable {
                reason: format!("{} requests in a row went unanswered", self.consecutive_failures),
            });
        }

        match failure {
            Some(source) => RequestError::Malformed { attempts, source },
            None => RequestError::Timeout { attempts },
        }
    }

    fn halt(&mut self, event: SchedulerEvent) {
        error!("Scheduler halting: {:?}", event);
        self.halted = true;
        let _ = self.events.send(event);
    }

    async fn shutdown(&mut self) {
        self.jobs.close();
        let mut cancelled = 0;
        while let Ok(job) = self.jobs.try_recv() {
            let _ = job.reply.send(Err(RequestError::SessionClosed));
            cancelled += 1;
        }
        if cancelled > 0 {
            info!("Cancelled {} queued request(s)", cancelled);
        }

        self.connection.close().await;
        info!("Scheduler stopped");
    }
}

/// Resolves once the session is closing or gone
async fn session_closed(state: &mut watch::Receiver<SessionState>) {
    // a dropped state owner counts as closed
    let _ = state.wait_for(|s| s.is_closed()).await;
}
