//! Continuation tokens: single-use permits to submit one write.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{FlowError, FlowResult};

/// Callback run when a token slot is released by dropping an unused token.
pub(crate) type ReleaseHook = Arc<dyn Fn() + Send + Sync>;

/// Counts outstanding tokens for one controller.
pub(crate) struct TokenLedger {
    outstanding: AtomicUsize,
    on_release: Mutex<Option<ReleaseHook>>,
}

impl TokenLedger {
    pub(crate) fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            on_release: Mutex::new(None),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn issue(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn retire(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub(crate) fn set_release_hook(&self, hook: ReleaseHook) {
        *self.on_release.lock() = Some(hook);
    }

    fn release(&self) {
        self.retire();
        let hook = self.on_release.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Permission to submit exactly one write.
///
/// Tokens are minted only by a [`FlowController`](crate::FlowController) and
/// cannot be cloned. Submitting a token consumes it; [`take`](Self::take)
/// moves the permission into a new value and leaves this one invalid.
/// Dropping an unused token hands its slot back to the controller.
#[must_use = "dropping a token gives up the permission to write"]
pub struct ContinuationToken {
    issuer: u64,
    valid: bool,
    ledger: Weak<TokenLedger>,
}

impl ContinuationToken {
    pub(crate) fn mint(issuer: u64, ledger: &Arc<TokenLedger>) -> Self {
        ledger.issue();
        Self {
            issuer,
            valid: true,
            ledger: Arc::downgrade(ledger),
        }
    }

    /// Returns true if the token still grants a write.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    /// Moves the permission out, leaving `self` invalid.
    pub fn take(&mut self) -> Self {
        let moved = Self {
            issuer: self.issuer,
            valid: self.valid,
            ledger: self.ledger.clone(),
        };
        self.valid = false;
        moved
    }

    /// Checks that the token is usable with the controller `issuer`.
    pub(crate) fn check(&self, issuer: u64) -> FlowResult<()> {
        if !self.valid {
            return Err(FlowError::InvalidToken {
                reason: "token already used",
            });
        }
        if self.issuer != issuer {
            return Err(FlowError::InvalidToken {
                reason: "token minted by another writer",
            });
        }
        Ok(())
    }

    /// Invalidates the token without releasing its slot to the hook.
    pub(crate) fn consume(&mut self) {
        if self.valid {
            self.valid = false;
            if let Some(ledger) = self.ledger.upgrade() {
                ledger.retire();
            }
        }
    }
}

impl Drop for ContinuationToken {
    fn drop(&mut self) {
        if self.valid {
            if let Some(ledger) = self.ledger.upgrade() {
                ledger.release();
            }
        }
    }
}

impl std::fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuationToken")
            .field("issuer", &self.issuer)
            .field("valid", &self.valid)
            .finish()
    }
}
