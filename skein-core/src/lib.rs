//! Skein Core - Strongly-typed identifiers, limits and errors for Skein.
//!
//! Skein is the client-side engine of a partitioned publish/subscribe topic
//! service. This crate holds the vocabulary shared by every other Skein crate:
//!
//! - **Identifiers**: `PartitionSessionId`, `PartitionId`, `Offset`, ...
//! - **Timestamps**: millisecond wall-clock timestamps carried by messages
//! - **Limits**: default flow-control budgets and timeouts, all explicit
//! - **Errors**: the core error type used for validation failures
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: a `PartitionId` can never be passed where a
//!   `PartitionSessionId` is expected
//! - **Explicit limits**: every budget has a bounded, validated default
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod timestamp;
mod types;

pub use error::{Error, Result};
pub use limits::{require_nonzero, require_positive, Limits};
pub use timestamp::Timestamp;
pub use types::{Offset, PartitionId, PartitionSessionId, ReadSessionId, WriteSessionId};
