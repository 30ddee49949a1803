//! Named async mutexes, created lazily per key.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Key guarding every ledger-mutating critical section.
pub const VALIDATOR_SERVICE_LOCK: &str = "validator-service";

#[derive(Clone, Default)]
pub struct KeyedMutex {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Waits for the mutex named `key`; released when the guard drops.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    pub fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(key).try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            let locks = KeyedMutex::new();
            let guard = locks.acquire(VALIDATOR_SERVICE_LOCK).await;
            assert!(locks.try_acquire(VALIDATOR_SERVICE_LOCK).is_none());
            assert!(locks.try_acquire("other").is_some());
            drop(guard);
            assert!(locks.clone().try_acquire(VALIDATOR_SERVICE_LOCK).is_some());
        })
        .await;
        assert!(result.is_ok());
    }
}
