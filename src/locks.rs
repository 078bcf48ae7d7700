//! Per-key async locks.
//!
//! Serializes work on one key (an author, an external comment id) while
//! unrelated keys proceed in parallel. Entries are dropped once no task
//! holds or waits on them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map of lazily created per-key mutexes.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held lock for one key. Releases and prunes on drop.
pub struct KeyGuard<'a> {
    // Field order matters: the mutex is released before pruning runs.
    _guard: OwnedMutexGuard<()>,
    _prune: Prune<'a>,
}

/// Removes the key's entry once nothing else references its mutex.
///
/// Created before the acquire is awaited, so a waiter cancelled mid-wait
/// still prunes the entry it may have kept alive.
struct Prune<'a> {
    key: String,
    locks: &'a KeyedLocks,
}

impl Drop for Prune<'_> {
    fn drop(&mut self) {
        // Only the map itself still references the mutex: nobody holds or waits.
        self.locks
            .locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let prune = Prune {
            key: key.to_string(),
            locks: self,
        };
        // Dropped ahead of `prune` if this future is cancelled while waiting
        let guard = mutex.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _prune: prune,
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks.lock("author-1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_entry() {
        let locks = KeyedLocks::new();
        let held = locks.lock("a").await;

        let mut waiter = Box::pin(locks.lock("a"));
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        // The waiter still references the mutex, so release keeps the entry
        drop(held);
        assert_eq!(locks.len(), 1);

        drop(waiter);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn timed_out_waiter_leaves_no_entry() {
        let locks = KeyedLocks::new();
        {
            let _held = locks.lock("a").await;
            let waited = tokio::time::timeout(Duration::from_millis(10), locks.lock("a")).await;
            assert!(waited.is_err());
        }
        assert!(locks.is_empty());
    }
}
