//! Skein Tests - scenario and property tests for the Skein topic client.
//!
//! Unit tests live next to the code in each crate. This crate drives whole
//! sessions against a scripted service and checks cross-module properties:
//!
//! ## Test Organization
//!
//! **Scenario Tests** (`*_tests.rs`): sessions, executors and flow control together
//! - `write_tests`: acknowledgement order, tokens, compression, reconnects
//! - `read_tests`: partition lifecycle, ordered delivery, commits, memory grants
//! - `executor_tests`: pools shared between sessions, bounded shutdown
//!
//! **Support Modules**:
//! - `mock_transport`: in-memory [`Transport`](skein_session::Transport) with scripted failures
//! - `server`: builders for service messages and a write server that acknowledges
//! - `properties`: invariant checkers (`check_acks`, `ReadObserver`)
//!
//! ## Naming Conventions
//!
//! - Scenario tests: `test_<component>_<scenario>`
//! - Unit tests: inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod mock_transport;
pub mod properties;
pub mod server;

pub use mock_transport::MockTransport;

#[cfg(test)]
mod write_tests;

/// Routes `tracing` output of a test run through the test harness.
///
/// Honors `RUST_LOG`; repeated calls are harmless.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
