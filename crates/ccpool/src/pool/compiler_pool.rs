//! Bounded pool of compiler processes.
//!
//! [`CompilerPool`] is driven from a single task through `&mut self`:
//! - [`CompilerPool::submit`] launches a job or queues it when the pool is full
//! - [`CompilerPool::sweep`] harvests exited jobs without blocking on live ones
//!   and promotes queued work into the freed slots
//! - [`CompilerPool::wait_until_done`] drains everything under a timeout and
//!   always tears down whatever is still running before it returns

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use ccpool_core::config::{MIN_POLL_INTERVAL_MS, PoolConfig, default_max_concurrency};
use tracing::{debug, info, warn};

use super::job::{Collected, CompileCommand, Job, RunningJob};
use super::report::{JobReport, JobStatus, ReportSink, StdoutSink};

/// Sleep between sweeps while draining.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(MIN_POLL_INTERVAL_MS);

/// Where the pool is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    /// Nothing submitted yet, or everything submitted has been harvested.
    Idle,
    /// Work is running or queued.
    Active,
    /// A blocking wait is in progress.
    Draining,
    /// The last wait hit its deadline; leftovers were torn down.
    TimedOut,
    /// The last wait was interrupted; leftovers were torn down.
    Interrupted,
}

/// Errors from the compiler pool.
///
/// Compiler failures are not errors: they set [`CompilerPool::failed`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Source is already scheduled: {}", .path.display())]
    DuplicateSource { path: PathBuf },

    #[error(
        "Hit build timeout of {} s ({terminated} job(s) terminated, {abandoned} never started)",
        .timeout.as_secs_f64()
    )]
    Timeout {
        timeout: Duration,
        terminated: usize,
        abandoned: usize,
    },

    #[error("Build interrupted ({terminated} job(s) terminated, {abandoned} never started)")]
    Interrupted { terminated: usize, abandoned: usize },
}

enum DrainOutcome {
    Drained,
    TimedOut,
    Interrupted,
}

/// A pool of source files being compiled in concurrent subprocesses.
pub struct CompilerPool {
    max_concurrency: usize,
    /// Live jobs keyed by source path.
    running: HashMap<PathBuf, RunningJob>,
    /// Jobs waiting for a slot. Promotion pops from the back.
    pending: Vec<Job>,
    /// Sticky: set by the first failed job, never cleared.
    failed: bool,
    phase: PoolPhase,
    poll_interval: Duration,
    sink: Box<dyn ReportSink>,
}

impl CompilerPool {
    /// Create a pool. `None` or `Some(0)` selects the CPU count plus two.
    pub fn new(max_concurrency: Option<usize>) -> Self {
        let limit = match max_concurrency {
            Some(n) if n > 0 => n,
            _ => default_max_concurrency(),
        };

        info!(max_concurrency = limit, "CompilerPool created");

        Self {
            max_concurrency: limit,
            running: HashMap::new(),
            pending: Vec::new(),
            failed: false,
            phase: PoolPhase::Idle,
            poll_interval: DEFAULT_POLL_INTERVAL,
            sink: Box::new(StdoutSink),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(Some(config.resolved_max_concurrency())).with_poll_interval(config.poll_interval())
    }

    /// Send job reports somewhere other than stdout.
    #[must_use]
    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Sleep between sweeps while draining. Clamped to at least 1 ms so the
    /// drain loop never spins.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether any job has failed so far.
    pub const fn failed(&self) -> bool {
        self.failed
    }

    pub const fn phase(&self) -> PoolPhase {
        self.phase
    }

    /// OS process IDs of the running compilers.
    pub fn running_pids(&self) -> Vec<u32> {
        self.running.values().filter_map(RunningJob::pid).collect()
    }

    /// True while anything is running or queued.
    pub fn is_outstanding(&self) -> bool {
        !self.running.is_empty() || !self.pending.is_empty()
    }

    /// Admit a job: launch it if a slot is free, otherwise queue it. Either
    /// way, a non-blocking sweep follows.
    ///
    /// A compiler that cannot be started counts as a failed job, it is not
    /// returned as an error.
    pub async fn submit(
        &mut self,
        source: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        command: CompileCommand,
    ) -> Result<(), PoolError> {
        let job = Job {
            source: source.into(),
            output: output.into(),
            command,
        };
        if self.is_scheduled(&job.source) {
            return Err(PoolError::DuplicateSource { path: job.source });
        }

        self.phase = PoolPhase::Active;
        if self.running.len() < self.max_concurrency {
            self.launch(job);
        } else {
            debug!(
                source = %job.source.display(),
                pending = self.pending.len() + 1,
                "Pool full, queueing job"
            );
            self.pending.push(job);
        }

        self.sweep(true).await;
        Ok(())
    }

    /// Harvest every running job that has exited, reporting each one. With
    /// `promote`, queued jobs then fill the free slots, most recently queued
    /// first.
    ///
    /// Never waits on a process that is still running.
    pub async fn sweep(&mut self, promote: bool) {
        let mut exited = Vec::new();
        for (source, job) in &mut self.running {
            match job.try_finish() {
                Ok(None) => {}
                Ok(Some(status)) => exited.push((source.clone(), Ok(status))),
                Err(e) => exited.push((source.clone(), Err(e))),
            }
        }

        for (source, status) in exited {
            if let Some(job) = self.running.remove(&source) {
                self.harvest(job, status).await;
            }
        }

        if promote {
            self.fill_free_slots();
        }
    }

    /// Block until every job has been harvested or `timeout` elapses.
    pub async fn wait_until_done(&mut self, timeout: Duration) -> Result<(), PoolError> {
        self.wait_until_done_or(timeout, std::future::pending()).await
    }

    /// Like [`wait_until_done`](Self::wait_until_done), but also stops when
    /// `shutdown` completes (e.g. on Ctrl+C).
    ///
    /// On every exit path a final non-promoting sweep runs, then every
    /// compiler still running is killed and queued jobs are dropped.
    pub async fn wait_until_done_or<F>(
        &mut self,
        timeout: Duration,
        shutdown: F,
    ) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send,
    {
        self.phase = PoolPhase::Draining;
        debug!(
            running = self.running.len(),
            pending = self.pending.len(),
            timeout_secs = timeout.as_secs_f64(),
            "Draining compiler pool"
        );

        let outcome = self.drain(timeout, shutdown).await;
        let (terminated, abandoned) = self.cleanup().await;

        match outcome {
            DrainOutcome::Drained => {
                self.phase = PoolPhase::Idle;
                info!(failed = self.failed, "Compiler pool drained");
                Ok(())
            }
            DrainOutcome::TimedOut => {
                self.phase = PoolPhase::TimedOut;
                Err(PoolError::Timeout {
                    timeout,
                    terminated,
                    abandoned,
                })
            }
            DrainOutcome::Interrupted => {
                self.phase = PoolPhase::Interrupted;
                Err(PoolError::Interrupted {
                    terminated,
                    abandoned,
                })
            }
        }
    }

    async fn drain<F>(&mut self, timeout: Duration, shutdown: F) -> DrainOutcome
    where
        F: Future<Output = ()> + Send,
    {
        let start = Instant::now();
        tokio::pin!(shutdown);

        while self.is_outstanding() {
            self.sweep(true).await;

            tokio::select! {
                () = &mut shutdown => {
                    warn!("Interrupted while draining compiler pool");
                    return DrainOutcome::Interrupted;
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            if self.is_outstanding() && start.elapsed() >= timeout {
                warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    running = self.running.len(),
                    pending = self.pending.len(),
                    "Build timeout reached"
                );
                return DrainOutcome::TimedOut;
            }
        }

        DrainOutcome::Drained
    }

    /// Harvest what already finished, then kill the rest. Returns how many
    /// jobs were killed and how many queued jobs were dropped.
    async fn cleanup(&mut self) -> (usize, usize) {
        self.sweep(false).await;

        let leftovers: Vec<RunningJob> = self.running.drain().map(|(_, job)| job).collect();
        let terminated = leftovers.len();
        for job in leftovers {
            let (job, _) = job.terminate().await;
            debug!(source = %job.source.display(), "Skipping report for terminated compiler");
        }
        if terminated > 0 {
            self.failed = true;
        }

        let abandoned = self.pending.len();
        if abandoned > 0 {
            warn!(abandoned, "Dropping queued jobs that never started");
            self.pending.clear();
        }

        (terminated, abandoned)
    }

    fn is_scheduled(&self, source: &Path) -> bool {
        self.running.contains_key(source) || self.pending.iter().any(|job| job.source == source)
    }

    fn fill_free_slots(&mut self) {
        while self.running.len() < self.max_concurrency {
            let Some(job) = self.pending.pop() else {
                break;
            };
            self.launch(job);
        }
    }

    /// Start a job. A launch failure is reported as a failed job.
    fn launch(&mut self, job: Job) {
        match RunningJob::launch(job) {
            Ok(running) => {
                let source = running.job().source.clone();
                debug!(
                    source = %source.display(),
                    pid = ?running.pid(),
                    running = self.running.len() + 1,
                    "Launched compiler"
                );
                self.running.insert(source, running);
            }
            Err((job, e)) => {
                warn!(
                    source = %job.source.display(),
                    program = %job.command.program().display(),
                    error = %e,
                    "Failed to launch compiler"
                );
                self.report(
                    &job,
                    JobStatus::SpawnFailed {
                        reason: e.to_string(),
                    },
                    Collected::Complete(String::new()),
                );
            }
        }
    }

    async fn harvest(&mut self, job: RunningJob, status: std::io::Result<ExitStatus>) {
        let status = match status {
            Ok(status) => JobStatus::from_exit(status),
            Err(e) => {
                warn!(
                    source = %job.job().source.display(),
                    error = %e,
                    "Failed to poll compiler status, killing it"
                );
                let _ = job.terminate().await;
                self.failed = true;
                return;
            }
        };

        let (job, collected) = job.collect().await;
        self.report(&job, status, collected);
    }

    /// Emit one job's report. An aborted collection means the job was torn
    /// down, so nothing is printed and only the failure is recorded.
    fn report(&mut self, job: &Job, status: JobStatus, collected: Collected) {
        let (captured, truncated) = match collected {
            Collected::Complete(captured) => (captured, false),
            Collected::Truncated(captured) => (captured, true),
            Collected::Aborted => {
                debug!(source = %job.source.display(), "Output not collected, skipping report");
                if status.is_failure() {
                    self.failed = true;
                }
                return;
            }
        };

        if status.is_failure() {
            self.failed = true;
            warn!(source = %job.source.display(), ?status, "Compilation failed");
        } else {
            info!(source = %job.source.display(), "Compiled");
        }

        let report = JobReport {
            source: job.source.clone(),
            output: job.output.clone(),
            command_line: job.command.command_line(),
            compiler: job.command.compiler_name(),
            captured,
            truncated,
            status,
        };
        self.sink.report(&report);
    }
}

impl Default for CompilerPool {
    fn default() -> Self {
        Self::new(None)
    }
}
