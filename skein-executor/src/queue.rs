//! Bounded task-queue executor.
//!
//! A fixed set of workers drains a FIFO queue. With `max_queue_size > 0` the
//! queue is bounded: a full queue either rejects the submission or blocks the
//! submitter until a worker frees a slot, depending on `blocking`.
//!
//! # Lifecycle
//!
//! ```text
//!   new ──start()──▶ running ──stop()──▶ terminated
//!                     │   ▲
//!          fork seen  │   │ workers respawned
//!                     ▼   │
//!                    stale
//! ```
//!
//! Shutdown discards jobs still in the queue; jobs a worker already popped
//! run to completion.

use std::collections::VecDeque;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::job::run_job;
use crate::registry::{self, ForkAware, Registration};
use crate::{Executor, ExecutorError, ExecutorResult, Job};

/// Configuration for a [`TaskQueueExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueExecutorConfig {
    /// Number of worker threads. Zero runs every job inline on the submitter.
    pub threads: usize,
    /// Maximum queued jobs; zero means unbounded.
    pub max_queue_size: usize,
    /// Whether a submission to a full queue waits for room instead of failing.
    pub blocking: bool,
    /// Whether a panicking job is caught and logged instead of killing its worker.
    pub catching: bool,
    /// Name used for worker threads and logs.
    pub name: String,
    /// Whether worker thread names get a `-N` suffix.
    pub numbered: bool,
}

impl Default for QueueExecutorConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            max_queue_size: 0,
            blocking: false,
            catching: true,
            name: "skein-pool".to_string(),
            numbered: true,
        }
    }
}

impl QueueExecutorConfig {
    /// Creates a config for testing: two workers and a small bounded queue.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            threads: 2,
            max_queue_size: 16,
            name: "skein-test-pool".to_string(),
            ..Self::default()
        }
    }

    /// Sets the worker count.
    #[must_use]
    pub const fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Sets the queue bound (zero for unbounded).
    #[must_use]
    pub const fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Sets whether full-queue submissions block.
    #[must_use]
    pub const fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
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
    /// Returns an error if the name is empty.
    pub fn validate(&self) -> ExecutorResult<()> {
        if self.name.is_empty() {
            return Err(ExecutorError::InvalidConfig {
                message: "executor name must not be empty".to_string(),
            });
        }
        Ok(())
    }

    fn thread_name(&self, index: usize) -> String {
        if self.numbered {
            format!("{}-{index}", self.name)
        } else {
            self.name.clone()
        }
    }
}

// ---- Shared state ----

struct QueueState {
    jobs: VecDeque<Job>,
    workers: Vec<JoinHandle<()>>,
    started: bool,
    terminating: bool,
    /// Bumped on every restart; workers of an older generation exit.
    generation: u64,
    owner_pid: u32,
}

struct Shared {
    config: QueueExecutorConfig,
    state: Mutex<QueueState>,
    /// Signalled when a job is queued or the pool terminates.
    job_ready: Condvar,
    /// Signalled when a job leaves the queue or the pool terminates.
    space_free: Condvar,
    forked: AtomicBool,
    live_threads: AtomicUsize,
}

impl Shared {
    fn is_stale(&self, state: &QueueState) -> bool {
        self.forked.load(Ordering::Acquire) || state.owner_pid != process::id()
    }

    fn run(&self, job: Job) {
        run_job(&self.config.name, self.config.catching, job);
    }
}

impl ForkAware for Shared {
    fn on_fork(&self) {
        self.forked.store(true, Ordering::Release);
    }
}

/// Decrements the live-thread count when a worker exits, panicking or not.
struct LiveGuard<'a>(&'a AtomicUsize);

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
    }
}

fn worker_loop(shared: &Shared, generation: u64) {
    let _live = LiveGuard(&shared.live_threads);
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.terminating || state.generation != generation {
                    return;
                }
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                shared.job_ready.wait(&mut state);
            }
        };
        shared.space_free.notify_one();
        shared.run(job);
    }
}

fn spawn_workers(shared: &Arc<Shared>, state: &mut QueueState) -> ExecutorResult<()> {
    let generation = state.generation;
    for index in 0..shared.config.threads {
        let worker = Arc::clone(shared);
        shared.live_threads.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(shared.config.thread_name(index))
            .spawn(move || worker_loop(&worker, generation));
        match spawned {
            Ok(handle) => state.workers.push(handle),
            Err(source) => {
                shared.live_threads.fetch_sub(1, Ordering::AcqRel);
                return Err(ExecutorError::Spawn {
                    name: shared.config.name.clone(),
                    source,
                });
            }
        }
    }
    Ok(())
}

/// Abandons the inherited workers and queue, then spawns a fresh worker set.
fn restart(shared: &Arc<Shared>, state: &mut QueueState) -> ExecutorResult<()> {
    let pid = process::id();
    if state.owner_pid != pid {
        // None of the inherited threads exist in this process.
        shared.live_threads.store(0, Ordering::Release);
    }
    warn!(
        executor = %shared.config.name,
        abandoned_workers = state.workers.len(),
        discarded_jobs = state.jobs.len(),
        "Restarting executor after fork"
    );
    state.workers.clear();
    state.jobs.clear();
    state.generation += 1;
    state.owner_pid = pid;
    shared.forked.store(false, Ordering::Release);
    shared.job_ready.notify_all();
    spawn_workers(shared, state)
}

// ---- Executor ----

/// Fixed-size worker pool with an optionally bounded FIFO queue.
pub struct TaskQueueExecutor {
    shared: Arc<Shared>,
    _registration: Registration,
}

impl TaskQueueExecutor {
    /// Creates an executor. It accepts no jobs until [`start`](Self::start).
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: QueueExecutorConfig) -> ExecutorResult<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                workers: Vec::new(),
                started: false,
                terminating: false,
                generation: 0,
                owner_pid: process::id(),
            }),
            job_ready: Condvar::new(),
            space_free: Condvar::new(),
            forked: AtomicBool::new(false),
            live_threads: AtomicUsize::new(0),
        });
        let weak: Weak<dyn ForkAware> = Arc::downgrade(&shared) as Weak<dyn ForkAware>;
        let registration = registry::register(weak);
        Ok(Self {
            shared,
            _registration: registration,
        })
    }

    /// Creates and starts an executor.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a worker cannot be spawned.
    pub fn started(config: QueueExecutorConfig) -> ExecutorResult<Self> {
        let executor = Self::new(config)?;
        executor.start()?;
        Ok(executor)
    }

    /// Spawns the workers. Starting a running executor is a no-op.
    ///
    /// # Errors
    /// Returns `ShuttingDown` after [`stop`](Self::stop), or `Spawn` if a
    /// worker thread cannot be created.
    pub fn start(&self) -> ExecutorResult<()> {
        let mut state = self.shared.state.lock();
        if state.terminating {
            return Err(self.shutting_down());
        }
        if state.started {
            return Ok(());
        }
        state.owner_pid = process::id();
        spawn_workers(&self.shared, &mut state)?;
        state.started = true;
        info!(
            executor = %self.shared.config.name,
            threads = self.shared.config.threads,
            max_queue_size = self.shared.config.max_queue_size,
            "Started task queue executor"
        );
        Ok(())
    }

    /// Submits a job.
    ///
    /// With zero workers the job runs before this call returns.
    ///
    /// # Errors
    /// - `NotStarted` before [`start`](Self::start)
    /// - `ShuttingDown` once [`stop`](Self::stop) began, including while blocked
    /// - `QueueFull` if the queue is full and the executor does not block
    pub fn submit(&self, job: Job) -> ExecutorResult<()> {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock();
        if !state.started {
            return Err(ExecutorError::NotStarted {
                name: config.name.clone(),
            });
        }
        if state.terminating {
            return Err(self.shutting_down());
        }
        if self.shared.is_stale(&state) {
            restart(&self.shared, &mut state)?;
        }

        if config.threads == 0 {
            drop(state);
            self.shared.run(job);
            return Ok(());
        }

        while config.max_queue_size > 0 && state.jobs.len() >= config.max_queue_size {
            if !config.blocking {
                return Err(ExecutorError::QueueFull {
                    size: state.jobs.len(),
                    max_size: config.max_queue_size,
                });
            }
            self.shared.space_free.wait(&mut state);
            if state.terminating {
                return Err(self.shutting_down());
            }
        }

        state.jobs.push_back(job);
        drop(state);
        self.shared.job_ready.notify_one();
        Ok(())
    }

    /// Stops the executor: discards queued jobs, wakes every waiter, and joins
    /// the workers. Jobs already running complete first.
    ///
    /// Never joins the calling thread, so a job may stop its own pool. In a
    /// forked child the inherited handles are abandoned instead of joined.
    pub fn stop(&self) {
        let (workers, discarded, stale) = {
            let mut state = self.shared.state.lock();
            if state.terminating {
                return;
            }
            state.terminating = true;
            let discarded = std::mem::take(&mut state.jobs);
            let workers = std::mem::take(&mut state.workers);
            (workers, discarded, self.shared.is_stale(&state))
        };
        self.shared.job_ready.notify_all();
        self.shared.space_free.notify_all();

        if !discarded.is_empty() {
            debug!(
                executor = %self.shared.config.name,
                discarded = discarded.len(),
                "Discarded queued jobs on stop"
            );
        }
        drop(discarded);

        if stale {
            return;
        }
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(executor = %self.shared.config.name, "Worker exited by panic");
            }
        }
        debug!(executor = %self.shared.config.name, "Stopped task queue executor");
    }

    /// Returns the number of queued jobs.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    /// Returns the number of worker handles the pool holds.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.shared.state.lock().workers.len()
    }

    /// Returns the number of worker threads that have not exited.
    #[must_use]
    pub fn live_thread_count(&self) -> usize {
        self.shared.live_threads.load(Ordering::Acquire)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &QueueExecutorConfig {
        &self.shared.config
    }

    fn shutting_down(&self) -> ExecutorError {
        ExecutorError::ShuttingDown {
            name: self.shared.config.name.clone(),
        }
    }

    /// Creates an already-running executor that runs every job inline.
    pub(crate) fn inline() -> Self {
        let config = QueueExecutorConfig::default()
            .with_threads(0)
            .with_name("skein-inline");
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                workers: Vec::new(),
                started: true,
                terminating: false,
                generation: 0,
                owner_pid: process::id(),
            }),
            job_ready: Condvar::new(),
            space_free: Condvar::new(),
            forked: AtomicBool::new(false),
            live_threads: AtomicUsize::new(0),
        });
        let weak: Weak<dyn ForkAware> = Arc::downgrade(&shared) as Weak<dyn ForkAware>;
        let registration = registry::register(weak);
        Self {
            shared,
            _registration: registration,
        }
    }

    #[cfg(test)]
    fn simulate_fork(&self) {
        self.shared.on_fork();
    }
}

impl Executor for TaskQueueExecutor {
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

impl Drop for TaskQueueExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TaskQueueExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueueExecutor")
            .field("config", &self.shared.config)
            .field("live_threads", &self.live_thread_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    /// Occupies the single worker until the returned sender is dropped or used.
    fn occupy_worker(executor: &TaskQueueExecutor) -> mpsc::Sender<()> {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        executor
            .submit(Box::new(move || {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            }))
            .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        release_tx
    }

    #[test]
    fn test_inline_runs_on_submitting_thread() {
        let executor =
            TaskQueueExecutor::started(QueueExecutorConfig::default().with_threads(0)).unwrap();
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        executor
            .submit(Box::new(move || tx.send(thread::current().id()).unwrap()))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), caller);
        assert_eq!(executor.thread_count(), 0);
    }

    #[test]
    fn test_submit_before_start_fails() {
        let executor = TaskQueueExecutor::new(QueueExecutorConfig::for_testing()).unwrap();
        let result = executor.submit(Box::new(|| {}));
        assert!(matches!(result, Err(ExecutorError::NotStarted { .. })));
    }

    #[test]
    fn test_empty_name_rejected() {
        let config = QueueExecutorConfig::default().with_name("");
        assert!(TaskQueueExecutor::new(config).is_err());
    }

    #[test]
    fn test_single_worker_runs_fifo() {
        let executor =
            TaskQueueExecutor::started(QueueExecutorConfig::default().with_threads(1)).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            executor.submit(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        let order: Vec<i32> = (0..10).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_threads_are_named() {
        let config = QueueExecutorConfig::default()
            .with_threads(1)
            .with_name("named");
        let executor = TaskQueueExecutor::started(config).unwrap();
        let (tx, rx) = mpsc::channel();
        executor
            .submit(Box::new(move || {
                tx.send(thread::current().name().map(str::to_string)).unwrap();
            }))
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().as_deref(), Some("named-0"));
    }

    #[test]
    fn test_full_queue_rejects_when_not_blocking() {
        let config = QueueExecutorConfig::default()
            .with_threads(1)
            .with_max_queue_size(2);
        let executor = TaskQueueExecutor::started(config).unwrap();
        let release = occupy_worker(&executor);

        executor.submit(Box::new(|| {})).unwrap();
        executor.submit(Box::new(|| {})).unwrap();
        assert_eq!(executor.queue_len(), 2);

        let result = executor.submit(Box::new(|| {}));
        assert!(matches!(
            result,
            Err(ExecutorError::QueueFull {
                size: 2,
                max_size: 2
            })
        ));

        release.send(()).unwrap();
        assert!(wait_until(|| executor.queue_len() == 0));
        executor.submit(Box::new(|| {})).unwrap();
    }

    #[test]
    fn test_blocking_submit_waits_for_room() {
        let config = QueueExecutorConfig::default()
            .with_threads(1)
            .with_max_queue_size(1)
            .with_blocking(true);
        let executor = Arc::new(TaskQueueExecutor::started(config).unwrap());
        let release = occupy_worker(&executor);
        executor.submit(Box::new(|| {})).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let submitter = {
            let executor = Arc::clone(&executor);
            thread::spawn(move || {
                let result = executor.submit(Box::new(move || done_tx.send(()).unwrap()));
                assert!(result.is_ok());
            })
        };

        // Still blocked while the worker is busy.
        thread::sleep(Duration::from_millis(50));
        assert!(!submitter.is_finished());

        release.send(()).unwrap();
        submitter.join().unwrap();
        done_rx.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_stop_discards_queue_and_wakes_submitters() {
        let config = QueueExecutorConfig::default()
            .with_threads(1)
            .with_max_queue_size(1)
            .with_blocking(true);
        let executor = Arc::new(TaskQueueExecutor::started(config).unwrap());
        let release = occupy_worker(&executor);

        let queued_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&queued_ran);
        executor
            .submit(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();

        let submitter = {
            let executor = Arc::clone(&executor);
            thread::spawn(move || executor.submit(Box::new(|| {})))
        };
        thread::sleep(Duration::from_millis(50));

        let stopper = {
            let executor = Arc::clone(&executor);
            thread::spawn(move || executor.stop())
        };

        let blocked = submitter.join().unwrap();
        assert!(matches!(blocked, Err(ExecutorError::ShuttingDown { .. })));

        // The running job finishes, then the stop completes.
        release.send(()).unwrap();
        stopper.join().unwrap();

        assert!(!queued_ran.load(Ordering::SeqCst));
        assert_eq!(executor.queue_len(), 0);
        assert_eq!(executor.live_thread_count(), 0);
        assert!(matches!(
            executor.submit(Box::new(|| {})),
            Err(ExecutorError::ShuttingDown { .. })
        ));
        assert!(executor.start().is_err());
    }

    #[test]
    fn test_catching_worker_survives_panic() {
        let executor =
            TaskQueueExecutor::started(QueueExecutorConfig::default().with_threads(1)).unwrap();
        executor.submit(Box::new(|| panic!("job failure"))).unwrap();

        let (tx, rx) = mpsc::channel();
        executor.submit(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv_timeout(WAIT).unwrap();
        assert_eq!(executor.live_thread_count(), 1);
    }

    #[test]
    fn test_non_catching_panic_kills_worker_without_hanging_stop() {
        let config = QueueExecutorConfig::default()
            .with_threads(1)
            .with_catching(false);
        let executor = TaskQueueExecutor::started(config).unwrap();
        executor.submit(Box::new(|| panic!("escapes"))).unwrap();

        assert!(wait_until(|| executor.live_thread_count() == 0));
        executor.stop();
    }

    #[test]
    fn test_stop_from_own_worker_does_not_deadlock() {
        let executor =
            Arc::new(TaskQueueExecutor::started(QueueExecutorConfig::default()).unwrap());
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&executor);
        executor
            .submit(Box::new(move || {
                inner.stop();
                tx.send(()).unwrap();
            }))
            .unwrap();
        rx.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_fork_flag_restarts_workers() {
        let executor =
            TaskQueueExecutor::started(QueueExecutorConfig::for_testing()).unwrap();
        let before: Vec<_> = executor
            .shared
            .state
            .lock()
            .workers
            .iter()
            .map(|h| h.thread().id())
            .collect();

        executor.simulate_fork();

        let counter = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel();
        let count = Arc::clone(&counter);
        executor
            .submit(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }))
            .unwrap();
        rx.recv_timeout(WAIT).unwrap();

        let after: Vec<_> = executor
            .shared
            .state
            .lock()
            .workers
            .iter()
            .map(|h| h.thread().id())
            .collect();
        assert_eq!(after.len(), 2);
        assert!(after.iter().all(|id| !before.contains(id)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Workers of the abandoned generation exit on their own.
        assert!(wait_until(|| executor.live_thread_count() == 2));
    }
}
