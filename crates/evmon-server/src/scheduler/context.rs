// Per-job state and the handle given to running job bodies

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Point-in-time view of one job
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStatus {
    pub name: String,
    /// Period of a recurring job; `None` for one-shot jobs
    pub every_secs: Option<u64>,
    pub running: usize,
    pub runs: u64,
    pub fail_count: u64,
    pub cancelled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct JobState {
    status: Mutex<JobStatus>,
}

impl JobState {
    pub(crate) fn new(name: &str, every: Option<Duration>) -> Self {
        Self {
            status: Mutex::new(JobStatus {
                name: name.to_string(),
                every_secs: every.map(|d| d.as_secs()),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn snapshot(&self) -> JobStatus {
        self.lock().clone()
    }

    pub(crate) fn started(&self) {
        let mut status = self.lock();
        status.running += 1;
        status.runs += 1;
        status.last_run_at = Some(Utc::now());
    }

    pub(crate) fn finished(&self) {
        let mut status = self.lock();
        status.running = status.running.saturating_sub(1);
        status.last_finished_at = Some(Utc::now());
    }

    pub(crate) fn touch(&self) {
        self.lock().last_heartbeat_at = Some(Utc::now());
    }

    pub(crate) fn fail(&self, error: String) {
        let mut status = self.lock();
        status.fail_count += 1;
        status.last_failed_at = Some(Utc::now());
        status.last_error = Some(error);
    }

    pub(crate) fn mark_cancelled(&self) {
        self.lock().cancelled = true;
    }
}

/// Process-wide "stop everything and exit non-zero" signal
#[derive(Debug, Clone, Default)]
pub struct FatalSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl FatalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal; the first reason wins
    pub fn raise(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.token.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Wait until the signal is raised and return its reason
    pub async fn raised(&self) -> String {
        self.token.cancelled().await;
        self.reason().unwrap_or_default()
    }
}

/// Handle passed to every job invocation
#[derive(Clone)]
pub struct JobContext {
    name: Arc<str>,
    state: Arc<JobState>,
    cancel: CancellationToken,
    fatal: FatalSignal,
}

impl JobContext {
    /// A context not attached to any scheduler
    pub fn new(name: &str, cancel: CancellationToken, fatal: FatalSignal) -> Self {
        Self::attached(name, Arc::new(JobState::new(name, None)), cancel, fatal)
    }

    pub(crate) fn attached(
        name: &str,
        state: Arc<JobState>,
        cancel: CancellationToken,
        fatal: FatalSignal,
    ) -> Self {
        Self {
            name: Arc::from(name),
            state,
            cancel,
            fatal,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Heartbeat: the job is alive and making progress
    pub fn touch(&self) {
        self.state.touch();
    }

    /// Record a failure without ending the invocation
    pub fn fail(&self, error: &dyn Display) {
        tracing::warn!(job = %self.name, error = %error, "Job reported a failure");
        self.state.fail(error.to_string());
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Ask the host to shut down and exit with a failure status
    pub fn abort_process(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(job = %self.name, reason = %reason, "Job requested process abort");
        self.fatal.raise(reason);
    }

    pub fn status(&self) -> JobStatus {
        self.state.snapshot()
    }
}
