//! The unit of work and the executor contract.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::error;

use crate::ExecutorResult;

/// A unit of work. Jobs have no identity and cannot be cancelled once accepted.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs jobs.
///
/// Sessions hold executors as `Arc<dyn Executor>` so that the same pool can be
/// shared between several sessions.
pub trait Executor: Send + Sync {
    /// Submits a job for execution.
    ///
    /// # Errors
    /// Returns an error if the executor is not running or cannot take the job.
    fn submit(&self, job: Job) -> ExecutorResult<()>;

    /// Stops the executor. Jobs already running complete; no new jobs are accepted.
    fn stop(&self);

    /// Returns the executor name, used in thread names and logs.
    fn name(&self) -> &str;
}

/// Runs `job`, catching and logging a panic when `catching` is set.
pub(crate) fn run_job(executor: &str, catching: bool, job: Job) {
    if !catching {
        job();
        return;
    }
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        error!(
            executor = %executor,
            panic = %panic_message(payload.as_ref()),
            "Job panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
