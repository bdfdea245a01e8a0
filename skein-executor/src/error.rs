//! Executor error types.

/// Executor error type.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The executor has not been started.
    #[error("executor {name} not started")]
    NotStarted {
        /// Executor name.
        name: String,
    },

    /// The executor is stopping or stopped.
    #[error("executor {name} is shutting down")]
    ShuttingDown {
        /// Executor name.
        name: String,
    },

    /// The queue is at capacity and the executor does not block.
    #[error("queue full: {size} jobs (max {max_size})")]
    QueueFull {
        /// Current queue size.
        size: usize,
        /// Maximum queue size.
        max_size: usize,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker for {name}: {source}")]
    Spawn {
        /// Executor name.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },
}

/// Result type for executor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;
