//! The lock registry: a process-wide keyed advisory lock with bounded
//! waiting.
//!
//! `acquire` is a true test-and-set. The caller that inserts the entry
//! becomes its owner and holds a guard; everyone else polls once per
//! second up to the per-operation budget, re-attempting the insert on each
//! tick. Only the owner's guard (or the administrative `remove`) deletes
//! the entry, so a losing waiter can never release a lock it does not
//! hold.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::info;

/// Registry key guarding node-wide operations.
pub const LOCAL_HYPERVISOR: &str = "Local Hypervisor";

/// Default per-operation wait budget, seconds.
pub const DEFAULT_WAIT_SECS: u32 = 10;
/// Wait budget for clone and create, seconds.
pub const SLOW_WAIT_SECS: u32 = 60;

pub struct LockRegistry {
    entries: Mutex<HashSet<String>>,
    poll_interval: Duration,
    quiesce: Duration,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_timing(Duration::from_secs(1), Duration::from_secs(1))
    }

    /// Registry with custom poll/quiesce intervals; the production values
    /// are one second each.
    pub fn with_timing(poll_interval: Duration, quiesce: Duration) -> Arc<Self> {
        Arc::new(LockRegistry {
            entries: Mutex::new(HashSet::new()),
            poll_interval,
            quiesce,
        })
    }

    fn try_insert(&self, key: &str) -> bool {
        self.entries.lock().insert(key.to_string())
    }

    fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Acquire the entry for `key`, polling up to `budget` ticks. Returns
    /// the owner guard, or `None` when a concurrent holder outlasted the
    /// budget.
    pub async fn acquire(self: &Arc<Self>, key: &str, budget: u32) -> Option<LockGuard> {
        if self.try_insert(key) {
            info!(key, "issuing temporary lock");
            return Some(LockGuard {
                registry: self.clone(),
                key: Some(key.to_string()),
            });
        }

        info!(key, "temporary lock in effect, waiting");
        for tick in 1..=budget {
            sleep(self.poll_interval).await;
            info!(key, tick, budget, "checking for temporary lock");
            if self.try_insert(key) {
                info!(key, "no lock, continuing");
                return Some(LockGuard {
                    registry: self.clone(),
                    key: Some(key.to_string()),
                });
            }
        }

        info!(key, "lock in effect, try again later");
        None
    }

    /// Administrative insert; sleeps the quiescence interval so pollers
    /// observe the new state before the call returns.
    pub async fn insert(&self, key: &str) {
        info!(key, "adding temporary lock");
        self.entries.lock().insert(key.to_string());
        sleep(self.quiesce).await;
    }

    /// Administrative remove, with the same quiescence sleep.
    pub async fn remove(&self, key: &str) {
        info!(key, "removing temporary lock");
        self.delete(key);
        sleep(self.quiesce).await;
    }

    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.entries.lock().contains(key)
    }
}

/// Ownership of one registry entry. Dropping the guard releases the entry,
/// so every handler exit path releases exactly once.
pub struct LockGuard {
    registry: Arc<LockRegistry>,
    key: Option<String>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.registry.delete(&key);
        }
    }
}
