//! Per-session mutual exclusion.

use crate::model::SessionKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Map of session keys to async locks.
///
/// Entries nobody holds or waits on are pruned whenever a lock is taken.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<SessionKey, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &SessionKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(SessionLocks::new());
        let key = SessionKey::new("act", "user", "S1");

        let guard = locks.acquire(&key).await;
        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_other_keys_are_independent_and_pruned() {
        let locks = SessionLocks::new();
        let a = SessionKey::new("act", "user", "A");
        let b = SessionKey::new("act", "user", "B");

        let _held = locks.acquire(&a).await;
        drop(locks.acquire(&b).await);
        assert_eq!(locks.tracked(), 2);

        let _again = locks.acquire(&SessionKey::new("act", "user", "C")).await;
        // B is idle and dropped; A is still held.
        assert_eq!(locks.tracked(), 2);
    }
}
