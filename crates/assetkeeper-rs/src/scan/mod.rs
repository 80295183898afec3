//! Streaming scan sessions.
//!
//! A [`ScanSession`] owns one probe subprocess and one keep-alive timer and
//! pushes [`ScanEvent`]s into a bounded channel. Log events keep the order
//! the probe wrote them; at most one terminal event (`Result` or `Error`) is
//! sent and it is always last. Dropping the receiving end cancels the
//! session.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{InventoryError, InventoryResult},
    inventory::Reconciler,
    models::DiscoveredDevice,
    probe::{ProbeMode, ProbeRunner, RunningProbe},
    security::validate_target,
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Log(String),
    KeepAlive,
    Result(Vec<DiscoveredDevice>),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

pub struct ScanSession {
    id: Uuid,
    target: String,
    state: SessionState,
    probe: Option<RunningProbe>,
    keepalive: Duration,
    timeout: Duration,
    reconciler: Option<Reconciler>,
    cancel: CancellationToken,
}

impl ScanSession {
    /// Validates the target and spawns the probe. Nothing is spawned for an
    /// empty target.
    pub fn start(runner: &ProbeRunner, target: &str, keepalive: Duration) -> InventoryResult<Self> {
        let target = validate_target(target)?;
        let mut session = Self {
            id: Uuid::new_v4(),
            target,
            state: SessionState::Idle,
            probe: None,
            keepalive,
            timeout: runner.timeout(),
            reconciler: None,
            cancel: CancellationToken::new(),
        };
        session.probe = Some(runner.spawn(&session.target, ProbeMode::Streaming)?);
        session.transition(SessionState::Running);
        Ok(session)
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Handle for an explicit stop request.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn transition(&mut self, next: SessionState) {
        if self.state.is_terminal() {
            return;
        }
        info!(scan_id = %self.id, target = %self.target, from = %self.state, to = %next, "scan session");
        self.state = next;
    }

    /// Drives the session to a terminal state. The probe handle and the
    /// keep-alive timer are released on every path.
    pub async fn run(mut self, tx: mpsc::Sender<ScanEvent>) -> SessionState {
        let Some(mut probe) = self.probe.take() else {
            return self.state;
        };

        let outcome = self.drive(&mut probe, &tx).await;
        match outcome {
            Outcome::Finished(Ok(devices)) => {
                let devices = match &self.reconciler {
                    Some(r) => r.prepare(devices).await,
                    None => Ok(devices),
                };
                self.finish(&tx, devices).await;
            }
            Outcome::Finished(Err(e)) => self.finish(&tx, Err(e)).await,
            Outcome::TimedOut => {
                probe.kill().await;
                let err = InventoryError::ProbeTimeout(self.timeout);
                self.finish(&tx, Err(err)).await;
            }
            Outcome::Cancelled => {
                probe.kill().await;
                self.transition(SessionState::Cancelled);
            }
        }
        self.state
    }

    async fn drive(&mut self, probe: &mut RunningProbe, tx: &mpsc::Sender<ScanEvent>) -> Outcome {
        let period = self.keepalive;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = sleep(self.timeout);
        tokio::pin!(deadline);

        // stderr first; once it closes, wait for exit and stdout.
        loop {
            tokio::select! {
                biased;
                _ = tx.closed() => return Outcome::Cancelled,
                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                _ = &mut deadline => return Outcome::TimedOut,
                _ = keepalive.tick() => {
                    if tx.send(ScanEvent::KeepAlive).await.is_err() {
                        return Outcome::Cancelled;
                    }
                }
                line = probe.next_log_line() => match line {
                    Ok(Some(line)) => {
                        if tx.send(ScanEvent::Log(line)).await.is_err() {
                            return Outcome::Cancelled;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(scan_id = %self.id, error = %e, "probe log unreadable");
                        break;
                    }
                },
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = tx.closed() => return Outcome::Cancelled,
                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                _ = &mut deadline => return Outcome::TimedOut,
                _ = keepalive.tick() => {
                    if tx.send(ScanEvent::KeepAlive).await.is_err() {
                        return Outcome::Cancelled;
                    }
                }
                result = probe.wait() => return Outcome::Finished(result),
            }
        }
    }

    async fn finish(&mut self, tx: &mpsc::Sender<ScanEvent>, result: InventoryResult<Vec<DiscoveredDevice>>) {
        let (next, event) = match result {
            Ok(devices) => {
                info!(scan_id = %self.id, devices = devices.len(), "scan completed");
                (SessionState::Completed, ScanEvent::Result(devices))
            }
            Err(e) => {
                warn!(scan_id = %self.id, error = %e, "scan failed");
                (SessionState::Failed, ScanEvent::Error(e.to_string()))
            }
        };
        if tx.send(event).await.is_err() {
            self.transition(SessionState::Cancelled);
            return;
        }
        self.transition(next);
    }
}

enum Outcome {
    Finished(InventoryResult<Vec<DiscoveredDevice>>),
    TimedOut,
    Cancelled,
}

/// Running sessions by id, so a caller can stop one explicitly.
#[derive(Clone, Default)]
pub struct ScanRegistry {
    inner: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl ScanRegistry {
    /// Registers the session and runs it on its own task. The session is
    /// deregistered when it reaches a terminal state.
    pub async fn launch(&self, session: ScanSession) -> (Uuid, mpsc::Receiver<ScanEvent>, JoinHandle<SessionState>) {
        let id = session.id();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.inner.write().await.insert(id, session.cancel_token());

        let registry = self.clone();
        let handle = tokio::spawn(async move {
            let state = session.run(tx).await;
            registry.inner.write().await.remove(&id);
            state
        });
        (id, rx, handle)
    }

    /// Requests a stop. Returns false for unknown or already finished
    /// sessions.
    pub async fn stop(&self, id: &Uuid) -> bool {
        match self.inner.read().await.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn active(&self) -> usize {
        self.inner.read().await.len()
    }
}
