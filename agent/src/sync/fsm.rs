//! Finite state machine for the update scheduler

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    /// Waiting for the next timer tick or a check-now request
    Idle,

    /// Fetching the manifest
    Checking,

    /// Downloading changed files
    Applying,

    /// Waiting out a failed check
    Backoff,

    /// Credential or configuration rejected; needs an operator
    Halted,
}

/// Scheduler event
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// The check interval elapsed
    TimerFired,

    /// An operator asked for an immediate check
    CheckRequested,

    /// Manifest received; `changed` when some entry differs from local state
    ManifestFetched { changed: bool },

    /// Every download job of the cycle succeeded or failed on its own
    JobsResolved,

    /// The cycle failed as a whole with a recoverable error
    CycleFailed(String),

    /// The backoff delay elapsed
    BackoffElapsed,

    /// Authentication or configuration failure
    Halt(String),
}

/// Update scheduler FSM
#[derive(Debug, Clone)]
pub struct SchedulerFsm {
    state: SchedulerState,
    error: Option<String>,
    err_streak: u32,
    cooldown: CooldownOptions,
}

impl SchedulerFsm {
    /// Create a new FSM in idle state
    pub fn new(cooldown: CooldownOptions) -> Self {
        Self {
            state: SchedulerState::Idle,
            error: None,
            err_streak: 0,
            cooldown,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Last failure, cleared by a successful cycle
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Consecutive failed cycles
    pub fn err_streak(&self) -> u32 {
        self.err_streak
    }

    pub fn is_halted(&self) -> bool {
        self.state == SchedulerState::Halted
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: SchedulerEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            // Halted is terminal
            (SchedulerState::Halted, _) => {
                return Err(format!("Scheduler is halted, ignoring {:?}", event));
            }
            (_, SchedulerEvent::Halt(reason)) => {
                self.error = Some(reason.clone());
                SchedulerState::Halted
            }

            // From Idle
            (SchedulerState::Idle, SchedulerEvent::TimerFired)
            | (SchedulerState::Idle, SchedulerEvent::CheckRequested) => SchedulerState::Checking,

            // From Checking
            (SchedulerState::Checking, SchedulerEvent::ManifestFetched { changed: true }) => {
                SchedulerState::Applying
            }
            (SchedulerState::Checking, SchedulerEvent::ManifestFetched { changed: false }) => {
                self.error = None;
                self.err_streak = 0;
                SchedulerState::Idle
            }

            // From Applying
            (SchedulerState::Applying, SchedulerEvent::JobsResolved) => {
                self.error = None;
                self.err_streak = 0;
                SchedulerState::Idle
            }

            (SchedulerState::Checking, SchedulerEvent::CycleFailed(err))
            | (SchedulerState::Applying, SchedulerEvent::CycleFailed(err)) => {
                self.error = Some(err.clone());
                self.err_streak = self.err_streak.saturating_add(1);
                SchedulerState::Backoff
            }

            // From Backoff
            (SchedulerState::Backoff, SchedulerEvent::BackoffElapsed)
            | (SchedulerState::Backoff, SchedulerEvent::CheckRequested) => SchedulerState::Checking,

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }

    /// Delay before the retry of the current failure streak
    pub fn backoff_delay(&self) -> Duration {
        calc_exp_backoff(&self.cooldown, self.err_streak.saturating_sub(1))
    }

    /// How long to wait before the next check; `None` once halted
    pub fn next_wait(&self, interval: Duration) -> Option<Duration> {
        match self.state {
            SchedulerState::Halted => None,
            SchedulerState::Backoff => Some(self.backoff_delay()),
            _ => Some(interval),
        }
    }
}

impl Default for SchedulerFsm {
    fn default() -> Self {
        Self::new(CooldownOptions::default())
    }
}
