//! Fork handling through the process-wide registry.
//!
//! Runs in its own test binary: `mark_forked` flags every pool in the
//! process, which would disturb unrelated pools running concurrently.

use std::sync::mpsc;
use std::time::Duration;

use skein_executor::{registry, QueueExecutorConfig, TaskQueueExecutor};

#[test]
fn test_mark_forked_restarts_registered_pools() {
    let config = QueueExecutorConfig::default()
        .with_threads(2)
        .with_name("fork-test");
    let executor = TaskQueueExecutor::started(config).unwrap();
    assert!(registry::registered_count() >= 1);

    assert!(registry::mark_forked() >= 1);

    // The next submission restarts the workers before enqueueing.
    let (tx, rx) = mpsc::channel();
    executor.submit(Box::new(move || tx.send(()).unwrap())).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(executor.thread_count(), 2);

    executor.stop();
    assert!(executor.submit(Box::new(|| {})).is_err());
}
