//! In-process job scheduler
//!
//! Runs one-shot and recurring jobs on the Tokio runtime with two ceilings:
//! a global limit on concurrently running job bodies and a per-job limit on
//! overlapping invocations of the same job. A recurring tick that finds its
//! job at the per-job limit is skipped.
//!
//! Every job gets a child of the scheduler's shutdown token, so jobs can be
//! cancelled individually by name ([`JobScheduler::cancel_matching`]) or all
//! together ([`JobScheduler::stop`]).

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;

mod context;

pub use context::{FatalSignal, JobContext, JobStatus};
use context::JobState;

/// A unit of scheduled work
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: JobContext) -> anyhow::Result<()>;
}

struct JobEntry {
    name: String,
    job: Arc<dyn Job>,
    state: Arc<JobState>,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
}

pub struct JobScheduler {
    config: SchedulerConfig,
    global: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    fatal: FatalSignal,
    jobs: Mutex<Vec<Arc<JobEntry>>>,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            global: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            fatal: FatalSignal::new(),
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Signal raised by jobs that need the whole process to stop
    pub fn fatal_signal(&self) -> FatalSignal {
        self.fatal.clone()
    }

    /// Run `job` now and then once per `interval`
    pub fn every(&self, interval: Duration, job: Arc<dyn Job>) {
        let entry = self.register(job, Some(interval));
        let global = self.global.clone();
        let fatal = self.fatal.clone();
        let tracker = self.tracker.clone();

        tracing::info!(job = %entry.name, every_secs = interval.as_secs(), "Scheduled recurring job");

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = entry.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tracker.spawn(run_entry(entry.clone(), global.clone(), fatal.clone()));
                    }
                }
            }

            tracing::debug!(job = %entry.name, "Recurring job stopped");
        });
    }

    /// Run `job` once, immediately
    pub fn now(&self, job: Arc<dyn Job>) {
        let entry = self.register(job, None);
        tracing::info!(job = %entry.name, "Scheduled job");
        self.tracker
            .spawn(run_entry(entry, self.global.clone(), self.fatal.clone()));
    }

    /// Cancel every job whose name matches `pattern`; returns how many matched
    pub fn cancel_matching(&self, pattern: &Regex) -> usize {
        let jobs = self.lock_jobs();
        let mut cancelled = 0;
        for entry in jobs.iter().filter(|e| pattern.is_match(&e.name)) {
            entry.cancel.cancel();
            entry.state.mark_cancelled();
            cancelled += 1;
        }

        tracing::info!(pattern = %pattern, cancelled, "Cancelled matching jobs");
        cancelled
    }

    /// Cancel all jobs and wait for running invocations to return
    pub async fn stop(&self) {
        tracing::info!("Stopping scheduler");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Scheduler stopped");
    }

    pub fn snapshot(&self) -> Vec<JobStatus> {
        self.lock_jobs().iter().map(|e| e.state.snapshot()).collect()
    }

    fn register(&self, job: Arc<dyn Job>, every: Option<Duration>) -> Arc<JobEntry> {
        let name = job.name().to_string();
        let entry = Arc::new(JobEntry {
            state: Arc::new(JobState::new(&name, every)),
            cancel: self.shutdown.child_token(),
            permits: Arc::new(Semaphore::new(self.config.default_concurrency)),
            name,
            job,
        });
        self.lock_jobs().push(entry.clone());
        entry
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, Vec<Arc<JobEntry>>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_entry(entry: Arc<JobEntry>, global: Arc<Semaphore>, fatal: FatalSignal) {
    let Ok(_job_permit) = entry.permits.clone().try_acquire_owned() else {
        tracing::debug!(job = %entry.name, "Job at its concurrency limit, skipping run");
        return;
    };

    let _global_permit = tokio::select! {
        _ = entry.cancel.cancelled() => return,
        permit = global.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    let ctx = JobContext::attached(&entry.name, entry.state.clone(), entry.cancel.clone(), fatal);

    entry.state.started();
    tracing::info!(job = %entry.name, "Job started");

    match entry.job.run(ctx).await {
        Ok(()) => tracing::info!(job = %entry.name, "Job finished"),
        Err(e) => {
            let error = format!("{:#}", e);
            tracing::error!(job = %entry.name, error = %error, "Job failed");
            entry.state.fail(error);
        }
    }

    entry.state.finished();
}
