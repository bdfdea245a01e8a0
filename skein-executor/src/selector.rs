//! Chooses an executor implementation from a thread count.

use std::sync::Arc;
use std::time::Duration;

use skein_core::Limits;

use crate::{
    ElasticExecutor, ElasticExecutorConfig, Executor, ExecutorResult, QueueExecutorConfig,
    TaskQueueExecutor,
};

/// Idle timeout of elastic pools created by [`executor_for`].
pub const DEFAULT_ELASTIC_IDLE_TIMEOUT: Duration = Limits::new().elastic_idle_timeout;

/// Returns a started bounded pool with `threads` workers, or an elastic pool
/// when `threads` is zero.
///
/// # Errors
/// Returns an error if a worker thread cannot be spawned.
pub fn executor_for(threads: usize) -> ExecutorResult<Arc<dyn Executor>> {
    if threads > 0 {
        let config = QueueExecutorConfig::default().with_threads(threads);
        return Ok(Arc::new(TaskQueueExecutor::started(config)?));
    }
    let config = ElasticExecutorConfig::default().with_idle_timeout(DEFAULT_ELASTIC_IDLE_TIMEOUT);
    Ok(Arc::new(ElasticExecutor::new(config)?))
}

/// Returns an executor that runs every job on the submitting thread.
#[must_use]
pub fn inline_executor() -> Arc<dyn Executor> {
    Arc::new(TaskQueueExecutor::inline())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_positive_threads_select_bounded_pool() {
        let executor = executor_for(2).unwrap();
        assert_eq!(executor.name(), "skein-pool");
        let (tx, rx) = mpsc::channel();
        executor.submit(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_zero_threads_select_elastic_pool() {
        let executor = executor_for(0).unwrap();
        assert_eq!(executor.name(), "skein-elastic");
        executor.stop();
    }

    #[test]
    fn test_inline_executor_runs_in_place() {
        let executor = inline_executor();
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        executor
            .submit(Box::new(move || tx.send(thread::current().id()).unwrap()))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), caller);
    }
}
