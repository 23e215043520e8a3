//! Per-key mutual exclusion for conversation and relationship state.
//!
//! The registry map sits behind a short-lived `std::sync::Mutex` that only
//! covers insert-if-absent. Callers receive an `Arc` to the per-key async
//! mutex and lock it after the registry guard is gone, so a slow critical
//! section on one key never stalls lookups for another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type KeyLock = Arc<AsyncMutex<()>>;

#[derive(Default)]
pub struct ConversationLockRegistry {
    locks: Mutex<HashMap<String, KeyLock>>,
}

impl ConversationLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the mutex for `key`, creating it on first use.
    pub fn get_or_create_lock(&self, key: &str) -> KeyLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Acquire the critical section for `key`.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.get_or_create_lock(key);
        lock.lock_owned().await
    }

    /// Drop locks that nobody holds or waits on. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
