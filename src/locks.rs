//! Per-key async locks: callers for the same key run one at a time, different keys never wait on each other.
//!
//! An entry lives only while someone holds or waits for its lock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct KeyedLocks<K> {
    inflight: std::sync::Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

/// Held lock for one key. Dropping it releases the lock and evicts the entry when nobody
/// else is waiting.
pub struct KeyGuard<'a, K: Eq + Hash> {
    locks: &'a KeyedLocks<K>,
    key: K,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            inflight: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, key: &K) -> KeyGuard<'_, K> {
        let lock = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                inflight
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.clone(),
            lock,
            guard: Some(guard),
        }
    }

    /// Keys currently held or waited on.
    pub fn active_keys(&self) -> Vec<K> {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut inflight = self.locks.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        // One handle in the map, one here: no waiters left.
        if Arc::strong_count(&self.lock) == 2 {
            inflight.remove(&self.key);
        }
    }
}
