//! Per-key async mutex
//!
//! Serializes work on one key (a `(user_id, source_song_id)` pair in the
//! duplicate guard) while letting unrelated keys proceed in parallel.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Map of lazily created per-key locks
///
/// Entries are held weakly; a key's lock is dropped once no guard or waiter
/// references it, and stale entries are swept on later acquisitions.
#[derive(Debug)]
pub struct KeyedMutex<K> {
    locks: Mutex<HashMap<K, Weak<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = self.entry(key);
        lock.lock_owned().await
    }

    fn entry(&self, key: K) -> Arc<AsyncMutex<()>> {
        // Poisoning only happens if a holder panicked mid-insert; the map is
        // still structurally valid.
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = locks.get(&key).and_then(Weak::upgrade) {
            return existing;
        }

        if locks.len() >= 1024 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(key, Arc::downgrade(&lock));
        lock
    }

    /// Number of keys with a live lock
    pub fn active_keys(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.values().filter(|weak| weak.strong_count() > 0).count()
    }
}
