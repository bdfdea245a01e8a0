//! Write-side flow control for Skein sessions.
//!
//! A writer may only submit a message in exchange for a [`ContinuationToken`].
//! The [`FlowController`] mints tokens while the writer has headroom in its
//! two budgets, and withholds them once either is exhausted:
//!
//! - **Memory**: pending uncompressed bytes plus in-flight compressed bytes
//! - **Count**: accepted but not yet acknowledged messages
//!
//! # Architecture
//!
//! ```text
//!            mint_tokens()                    accept(token, ..)
//!  ┌─────────────┐ ─────────▶ application ─────────▶ ┌──────────────────┐
//!  │ TokenLedger │                                    │ in-flight queue  │
//!  └─────────────┘ ◀──── slot freed ──── acknowledge ─│ (submission order)│
//!                                                     └──────────────────┘
//! ```
//!
//! Acknowledgements must arrive in submission order. Messages whose explicit
//! sequence number is not above every previously accepted one are resolved
//! locally as already written, in their submission position.
//!
//! # Example
//!
//! ```rust
//! use skein_flow::{FlowController, FlowControllerConfig};
//!
//! let controller = FlowController::new(FlowControllerConfig::for_testing()).unwrap();
//! controller.set_init_seq_no(0);
//!
//! let mut tokens = controller.mint_tokens();
//! let mut token = tokens.pop().unwrap();
//! let accepted = controller.accept(&mut token, None, 128).unwrap();
//! assert_eq!(accepted.seq_no, 1);
//!
//! controller.on_sent(accepted.position);
//! controller.acknowledge(accepted.seq_no).unwrap();
//! assert!(controller.is_idle());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod controller;
mod error;
mod seqno;
mod token;

pub use controller::{AckedEntry, Accepted, FlowController, FlowControllerConfig, FlowStats};
pub use error::{FlowError, FlowResult};
pub use seqno::{Assigned, SeqNoMode, SeqNoTracker};
pub use token::ContinuationToken;
