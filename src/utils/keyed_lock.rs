//! Per-key async mutexes created on demand.
//!
//! Each lock family (reconcile, mode switch, scale) owns one `KeyedLocks`.
//! Entries live until `forget` is called for the key.
use std::sync::Arc;

use scc::HashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. The lock is released when the
    /// guard is dropped.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry_async(key.to_string())
            .await
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .get()
            .clone();
        mutex.lock_owned().await
    }

    /// Drop the mutex for a key that no longer exists.
    pub async fn forget(&self, key: &str) {
        let _ = self.locks.remove_async(key).await;
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_never_overlaps() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("shop/orders").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("shop/orders").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("shop/cart")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
        drop(b);
        locks.forget("shop/cart").await;
        assert_eq!(locks.len(), 1);
    }
}
