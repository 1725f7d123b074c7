//! Per-task mutual exclusion
//!
//! At most one lifecycle operation (create, resize, delete) runs per TaskID.
//! Operations on different tasks never contend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One task's mutex plus the number of holders and waiters using it
#[derive(Default)]
struct LockSlot {
    mutex: Arc<Mutex<()>>,
    users: AtomicUsize,
}

/// Map of TaskID to an async mutex, created on first use
#[derive(Clone, Default)]
pub struct TaskLocks {
    locks: Arc<DashMap<String, Arc<LockSlot>>>,
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`; released when the guard drops.
    ///
    /// Dropping the returned future before it resolves also gives up its
    /// claim on the map entry.
    pub async fn acquire(&self, key: &str) -> TaskLockGuard {
        let slot = {
            let entry = self
                .locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(LockSlot::default()));
            // registered under the shard lock so removal cannot race it
            entry.users.fetch_add(1, Ordering::SeqCst);
            entry.clone()
        };

        let mut guard = TaskLockGuard {
            key: key.to_string(),
            guard: None,
            slot: slot.clone(),
            locks: self.locks.clone(),
        };
        guard.guard = Some(slot.mutex.clone().lock_owned().await);
        guard
    }

    /// Number of keys with a holder or waiter
    #[cfg(test)]
    fn active(&self) -> usize {
        self.locks.len()
    }
}

/// Holds (or is waiting for) a task lock; the map entry is dropped once
/// nobody else wants it
pub struct TaskLockGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    slot: Arc<LockSlot>,
    locks: Arc<DashMap<String, Arc<LockSlot>>>,
}

impl Drop for TaskLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        if self.slot.users.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.locks
                .remove_if(&self.key, |_, slot| slot.users.load(Ordering::SeqCst) == 0);
        }
    }
}
