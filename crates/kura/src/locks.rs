//! Per-key async locks serializing operations on one run or stream name.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    users: usize,
}

/// A lock per key; keys are independent and their entries are dropped once
/// no holder or waiter remains.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    entries: Mutex<HashMap<String, Slot>>,
}

impl fmt::Debug for KeyedLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLocks").field("keys", &self.len()).finish()
    }
}

impl KeyedLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self, key: &str) -> KeyGuard<'_> {
        // Registered before waiting, so a cancelled waiter still releases it.
        let (slot_use, mutex) = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = entries.entry(key.to_string()).or_insert_with(|| Slot {
                mutex: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            slot.users += 1;
            (
                KeyUse {
                    locks: self,
                    key: key.to_string(),
                },
                Arc::clone(&slot.mutex),
            )
        };
        let guard = mutex.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _use: slot_use,
        }
    }

    fn release(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = entries.get_mut(key) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                entries.remove(key);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Debug)]
struct KeyUse<'a> {
    locks: &'a KeyedLocks,
    key: String,
}

impl Drop for KeyUse<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.key);
    }
}

/// Holds the lock of one key. The mutex is released before the entry.
#[derive(Debug)]
pub(crate) struct KeyGuard<'a> {
    _guard: OwnedMutexGuard<()>,
    _use: KeyUse<'a>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("run").await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_entry() {
        let locks = KeyedLocks::new();
        let holder = locks.lock("run").await;
        let mut waiter = tokio_test::task::spawn(locks.lock("run"));
        tokio_test::assert_pending!(waiter.poll());

        drop(holder);
        assert_eq!(locks.len(), 1);
        drop(waiter);
        assert_eq!(locks.len(), 0);

        let _again = locks.lock("run").await;
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
