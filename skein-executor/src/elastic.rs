//! Elastic executor: one worker per concurrent job, shrinking when idle.
//!
//! Submissions go through a single hand-off slot. A submitter waits until the
//! slot is empty, places its job, and either wakes an idle worker or spawns a
//! new one when none is idle. A worker waiting longer than `idle_timeout`
//! without receiving a job exits.
//!
//! A worker whose idle wait times out still checks the slot before leaving,
//! so a job handed off at the moment of the timeout is never stranded.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::job::run_job;
use crate::{Executor, ExecutorError, ExecutorResult, Job};

/// Configuration for an [`ElasticExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElasticExecutorConfig {
    /// How long an idle worker waits for a job before exiting.
    pub idle_timeout: Duration,
    /// Whether a panicking job is caught and logged.
    pub catching: bool,
    /// Name used for worker threads and logs.
    pub name: String,
}

impl Default for ElasticExecutorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: crate::DEFAULT_ELASTIC_IDLE_TIMEOUT,
            catching: true,
            name: "skein-elastic".to_string(),
        }
    }
}

impl ElasticExecutorConfig {
    /// Creates a config for testing with a short idle timeout.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            idle_timeout: Duration::from_millis(50),
            name: "skein-test-elastic".to_string(),
            ..Self::default()
        }
    }

    /// Sets the idle timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets whether job panics are caught.
    #[must_use]
    pub const fn with_catching(mut self, catching: bool) -> Self {
        self.catching = catching;
        self
    }

    /// Sets the pool name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the name is empty or the idle timeout is zero.
    pub fn validate(&self) -> ExecutorResult<()> {
        if self.name.is_empty() {
            return Err(ExecutorError::InvalidConfig {
                message: "executor name must not be empty".to_string(),
            });
        }
        if self.idle_timeout.is_zero() {
            return Err(ExecutorError::InvalidConfig {
                message: "idle_timeout must be positive".to_string(),
            });
        }
        Ok(())
    }
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the elastic pool the current thread works for, or zero.
    static CURRENT_POOL: Cell<u64> = const { Cell::new(0) };
}

struct ElasticState {
    slot: Option<Job>,
    idle: usize,
    live: usize,
    all_done: bool,
}

struct Shared {
    id: u64,
    config: ElasticExecutorConfig,
    state: Mutex<ElasticState>,
    /// Signalled when the slot is filled or the pool stops.
    job_ready: Condvar,
    /// Signalled when the slot is emptied or the pool stops.
    slot_free: Condvar,
    /// Signalled when a worker exits.
    worker_exit: Condvar,
}

/// Removes the worker from the live count on exit, panicking or not.
struct ExitGuard<'a>(&'a Shared);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.live = state.live.saturating_sub(1);
        drop(state);
        self.0.worker_exit.notify_all();
    }
}

fn worker_loop(shared: &Shared) {
    CURRENT_POOL.with(|pool| pool.set(shared.id));
    let _exit = ExitGuard(shared);
    loop {
        let job = {
            let mut state = shared.state.lock();
            state.idle += 1;
            while state.slot.is_none() && !state.all_done {
                if shared
                    .job_ready
                    .wait_for(&mut state, shared.config.idle_timeout)
                    .timed_out()
                {
                    break;
                }
            }
            state.idle -= 1;
            state.slot.take()
        };
        match job {
            Some(job) => {
                shared.slot_free.notify_one();
                run_job(&shared.config.name, shared.config.catching, job);
            }
            None => {
                debug!(executor = %shared.config.name, "Elastic worker exiting");
                return;
            }
        }
    }
}

/// Unbounded pool that grows on demand and shrinks when idle.
pub struct ElasticExecutor {
    shared: Arc<Shared>,
}

impl ElasticExecutor {
    /// Creates an executor. No thread exists until the first submission.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ElasticExecutorConfig) -> ExecutorResult<Self> {
        config.validate()?;
        info!(
            executor = %config.name,
            idle_timeout_ms = u64::try_from(config.idle_timeout.as_millis()).unwrap_or(u64::MAX),
            "Created elastic executor"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                config,
                state: Mutex::new(ElasticState {
                    slot: None,
                    idle: 0,
                    live: 0,
                    all_done: false,
                }),
                job_ready: Condvar::new(),
                slot_free: Condvar::new(),
                worker_exit: Condvar::new(),
            }),
        })
    }

    /// Submits a job, handing it to an idle worker or spawning a new one.
    ///
    /// # Errors
    /// Returns `ShuttingDown` once [`stop`](Self::stop) began, or `Spawn` if a
    /// needed worker cannot be created.
    pub fn submit(&self, job: Job) -> ExecutorResult<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        while state.slot.is_some() && !state.all_done {
            shared.slot_free.wait(&mut state);
        }
        if state.all_done {
            return Err(self.shutting_down());
        }

        state.slot = Some(job);
        if state.idle > 0 {
            drop(state);
            shared.job_ready.notify_one();
            return Ok(());
        }

        state.live += 1;
        let worker = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(shared.config.name.clone())
            .spawn(move || worker_loop(&worker));
        if let Err(source) = spawned {
            state.live -= 1;
            state.slot = None;
            drop(state);
            shared.slot_free.notify_one();
            return Err(ExecutorError::Spawn {
                name: shared.config.name.clone(),
                source,
            });
        }
        Ok(())
    }

    /// Stops the executor and waits until every worker has exited.
    ///
    /// A job handed off before the stop still runs. Called from one of this
    /// pool's own workers, waits for every other worker.
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.all_done = true;
        shared.job_ready.notify_all();
        shared.slot_free.notify_all();

        let own = usize::from(CURRENT_POOL.with(Cell::get) == shared.id);
        while state.live > own {
            shared.worker_exit.wait(&mut state);
        }
    }

    /// Returns the number of worker threads that have not exited.
    #[must_use]
    pub fn live_thread_count(&self) -> usize {
        self.shared.state.lock().live
    }

    /// Returns the number of workers waiting for a job.
    #[must_use]
    pub fn idle_thread_count(&self) -> usize {
        self.shared.state.lock().idle
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ElasticExecutorConfig {
        &self.shared.config
    }

    fn shutting_down(&self) -> ExecutorError {
        ExecutorError::ShuttingDown {
            name: self.shared.config.name.clone(),
        }
    }
}

impl Executor for ElasticExecutor {
    fn submit(&self, job: Job) -> ExecutorResult<()> {
        Self::submit(self, job)
    }

    fn stop(&self) {
        Self::stop(self);
    }

    fn name(&self) -> &str {
        &self.shared.config.name
    }
}

impl Drop for ElasticExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ElasticExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticExecutor")
            .field("config", &self.shared.config)
            .field("live_threads", &self.live_thread_count())
            .finish_non_exhaustive()
    }
}
