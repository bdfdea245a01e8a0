//! Process-wide registry of bounded pools, used to survive `fork()`.
//!
//! Worker threads do not survive `fork()`: the child inherits the pool's
//! memory but none of its threads. Every bounded pool registers a weak
//! reference here. A forked child calls [`mark_forked`] (typically from a
//! `pthread_atfork` child handler installed by the embedding application),
//! and each pool restarts its workers on the next submission.
//!
//! Pools also compare their recorded owner pid with the current process id,
//! so a child that never calls [`mark_forked`] still restarts correctly.

use std::collections::HashMap;
use std::sync::{OnceLock, Weak};

use parking_lot::Mutex;
use tracing::debug;

/// A pool that can be told it now lives in a forked child.
pub trait ForkAware: Send + Sync {
    /// Flags the pool so that its next submission restarts the workers.
    fn on_fork(&self);
}

struct Registry {
    next_id: u64,
    pools: HashMap<u64, Weak<dyn ForkAware>>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            next_id: 0,
            pools: HashMap::new(),
        })
    })
}

/// Handle returned by [`register`]; deregisters the pool when dropped.
#[derive(Debug)]
pub struct Registration {
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        registry().lock().pools.remove(&self.id);
    }
}

/// Registers a pool. The registry only holds a weak reference.
#[must_use]
pub fn register(pool: Weak<dyn ForkAware>) -> Registration {
    let mut registry = registry().lock();
    let id = registry.next_id;
    registry.next_id += 1;
    registry.pools.insert(id, pool);
    Registration { id }
}

/// Flags every registered pool as forked. Returns the number of pools flagged.
pub fn mark_forked() -> usize {
    // Upgrade under the lock, notify outside it: dropping the last strong
    // reference re-enters the registry through `Registration::drop`.
    let pools: Vec<_> = registry()
        .lock()
        .pools
        .values()
        .filter_map(Weak::upgrade)
        .collect();
    for pool in &pools {
        pool.on_fork();
    }
    debug!(pools = pools.len(), "Marked executors as forked");
    pools.len()
}

/// Returns the number of live registrations.
#[must_use]
pub fn registered_count() -> usize {
    registry().lock().pools.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Dummy;

    impl ForkAware for Dummy {
        fn on_fork(&self) {}
    }

    #[test]
    fn test_registration_removed_on_drop() {
        let pool: Arc<dyn ForkAware> = Arc::new(Dummy);
        let registration = register(Arc::downgrade(&pool));
        let id = registration.id;
        assert!(registry().lock().pools.contains_key(&id));

        drop(registration);
        assert!(!registry().lock().pools.contains_key(&id));
    }

    #[test]
    fn test_registration_ids_are_unique() {
        let pool: Arc<dyn ForkAware> = Arc::new(Dummy);
        let first = register(Arc::downgrade(&pool));
        let second = register(Arc::downgrade(&pool));
        assert_ne!(first.id, second.id);
    }
}
