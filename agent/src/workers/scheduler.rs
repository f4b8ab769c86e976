//! Scheduler worker: runs check cycles on a timer and on request

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info};

use crate::errors::{ErrorKind, SyncError};
use crate::sync::fsm::{SchedulerEvent, SchedulerFsm, SchedulerState};
use crate::sync::state::LocalSyncState;
use crate::sync::syncer::{CycleReport, Syncer};

/// Scheduler worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between scheduled checks
    pub interval: Duration,

    /// Delay before the first check
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            initial_delay: Duration::from_secs(5),
        }
    }
}

/// Why a requested check did not produce a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SyncError> for CheckError {
    fn from(err: &SyncError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl CheckError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Rebuild an error of the same kind, e.g. on the client side of the control server
    pub fn into_error(self) -> SyncError {
        match self.kind {
            ErrorKind::Configuration => SyncError::ConfigError(self.message),
            ErrorKind::Auth => SyncError::AuthError(self.message),
            ErrorKind::TransientNetwork => SyncError::TransientNetworkError(self.message),
            ErrorKind::Server => SyncError::ServerError(self.message),
            ErrorKind::Client => SyncError::ClientError(self.message),
            ErrorKind::IntegrityMismatch => SyncError::IntegrityMismatch(self.message),
            ErrorKind::Storage => SyncError::StorageError(self.message),
            ErrorKind::Internal => SyncError::Internal(self.message),
        }
    }
}

pub type CheckReply = Result<CycleReport, CheckError>;

/// Ask the running scheduler for an immediate check
#[derive(Debug)]
pub struct CheckRequest {
    /// Restrict the check to one manifest entry
    pub only: Option<String>,
    pub reply: oneshot::Sender<CheckReply>,
}

impl CheckRequest {
    pub fn new(only: Option<String>) -> (Self, oneshot::Receiver<CheckReply>) {
        let (reply, rx) = oneshot::channel();
        (Self { only, reply }, rx)
    }
}

/// Read-only view of the scheduler, shared with the control server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub device_id: String,
    pub state: SchedulerState,
    pub err_streak: u32,
    pub last_error: Option<String>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_check_at: Option<DateTime<Utc>>,
    pub tracked_files: usize,
    pub applied_total: u64,
    pub last_report: Option<CycleReport>,
}

impl SchedulerStatus {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            state: SchedulerState::Idle,
            err_streak: 0,
            last_error: None,
            last_check_at: None,
            last_success_at: None,
            next_check_at: None,
            tracked_files: 0,
            applied_total: 0,
            last_report: None,
        }
    }
}

pub type StatusHandle = Arc<RwLock<SchedulerStatus>>;

/// Run the scheduler worker until shutdown or until it halts.
///
/// Returns the final sync state on shutdown, or the fatal error that halted it.
#[allow(clippy::too_many_arguments)]
pub async fn run<S, F>(
    options: &Options,
    syncer: &mut Syncer,
    fsm: &mut SchedulerFsm,
    mut state: LocalSyncState,
    status: StatusHandle,
    mut check_rx: mpsc::Receiver<CheckRequest>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<LocalSyncState, SyncError>
where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Scheduler worker starting...");
    status.write().await.tracked_files = state.len();

    let mut wait = options.initial_delay;
    loop {
        status.write().await.next_check_at = chrono::Duration::from_std(wait)
            .ok()
            .map(|wait| Utc::now() + wait);

        let (trigger, requests) = tokio::select! {
            biased;
            _ = &mut shutdown_signal => {
                info!("Scheduler worker shutting down...");
                return Ok(state);
            }
            Some(first) = check_rx.recv() => {
                let mut requests = vec![first];
                while let Ok(more) = check_rx.try_recv() {
                    requests.push(more);
                }
                debug!("Serving {} check request(s)", requests.len());
                (SchedulerEvent::CheckRequested, requests)
            }
            _ = sleep_fn(wait) => {
                let event = if fsm.state() == SchedulerState::Backoff {
                    SchedulerEvent::BackoffElapsed
                } else {
                    SchedulerEvent::TimerFired
                };
                (event, Vec::new())
            }
        };

        {
            let mut status = status.write().await;
            status.state = SchedulerState::Checking;
            status.next_check_at = None;
        }

        let only = common_scope(&requests);
        let outcome = tokio::select! {
            biased;
            _ = &mut shutdown_signal => None,
            result = syncer.run_cycle(fsm, trigger, &mut state, only.as_deref()) => Some(result),
        };
        let Some(result) = outcome else {
            info!("Scheduler worker shutting down mid-check...");
            return Ok(state);
        };

        let reply: CheckReply = match &result {
            Ok(report) => Ok(report.clone()),
            Err(e) => Err(CheckError::from(e)),
        };
        for request in requests {
            // the requester may have given up waiting
            let _ = request.reply.send(reply.clone());
        }
        publish(&status, fsm, &state, &result).await;

        if let Err(e) = result {
            if fsm.is_halted() {
                error!("Scheduler worker halted: {}", e);
                return Err(e);
            }
        }

        wait = match fsm.next_wait(options.interval) {
            Some(wait) => wait,
            None => {
                return Err(SyncError::Internal(format!(
                    "scheduler stopped in state {:?}",
                    fsm.state()
                )))
            }
        };
        if fsm.state() == SchedulerState::Backoff {
            info!(
                "Retrying in {}s (failure streak {})",
                wait.as_secs_f64(),
                fsm.err_streak()
            );
        }
    }
}

/// A narrowed check only when every coalesced request asks for the same file
fn common_scope(requests: &[CheckRequest]) -> Option<String> {
    let first = requests.first()?.only.as_ref()?;
    requests
        .iter()
        .all(|r| r.only.as_ref() == Some(first))
        .then(|| first.clone())
}

async fn publish(
    status: &StatusHandle,
    fsm: &SchedulerFsm,
    state: &LocalSyncState,
    result: &Result<CycleReport, SyncError>,
) {
    let mut status = status.write().await;
    let now = Utc::now();
    status.state = fsm.state();
    status.err_streak = fsm.err_streak();
    status.last_error = fsm.error().map(str::to_string);
    status.last_check_at = Some(now);
    status.tracked_files = state.len();
    if let Ok(report) = result {
        if fsm.state() != SchedulerState::Backoff {
            status.last_success_at = Some(now);
        }
        status.applied_total += report.applied.len() as u64;
        status.last_report = Some(report.clone());
    }
}
