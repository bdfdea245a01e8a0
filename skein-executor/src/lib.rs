//! Job executors for Skein sessions.
//!
//! Every callback, compression and decompression job a session produces runs
//! on one of these executors, never on the transport thread. Two pools are
//! provided:
//!
//! - **`TaskQueueExecutor`**: a fixed set of workers draining a FIFO queue
//!   with an optional capacity bound. Zero workers means inline execution.
//! - **`ElasticExecutor`**: grows a worker per concurrent job and shrinks
//!   when workers sit idle for longer than the configured timeout.
//!
//! # Architecture
//!
//! ```text
//!   submit(job) ──▶ ┌──────────────────────┐      ┌──────────┐
//!                   │ TaskQueueExecutor    │─────▶│ worker 0 │
//!                   │  VecDeque<Job>       │─────▶│ worker 1 │
//!                   │  max_queue_size      │─────▶│   ...    │
//!                   └──────────────────────┘      └──────────┘
//!
//!   submit(job) ──▶ ┌──────────────────────┐      ┌──────────┐
//!                   │ ElasticExecutor      │─────▶│ idle or  │
//!                   │  single hand-off slot│      │ spawned  │
//!                   └──────────────────────┘      └──────────┘
//! ```
//!
//! Bounded pools register themselves with a process-wide [`registry`] so that
//! a forked child restarts its workers before accepting new work.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod elastic;
mod error;
mod job;
mod queue;
pub mod registry;
mod selector;

pub use elastic::{ElasticExecutor, ElasticExecutorConfig};
pub use error::{ExecutorError, ExecutorResult};
pub use job::{Executor, Job};
pub use queue::{QueueExecutorConfig, TaskQueueExecutor};
pub use selector::{executor_for, inline_executor, DEFAULT_ELASTIC_IDLE_TIMEOUT};
