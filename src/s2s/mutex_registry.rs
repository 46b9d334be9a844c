//! Remote-auth mutex registry (component B).
//!
//! Serializes concurrent `authenticate_domain` calls against the same
//! remote domain while letting calls against different domains proceed in
//! parallel. Lock entries are interned by domain name and reclaimed once no
//! caller references them, so the registry does not grow unbounded over the
//! life of the process.

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;

/// A weakly-referenced, interned map of per-domain locks.
pub struct RemoteAuthMutexRegistry {
    locks: DashMap<String, Weak<AsyncMutex<()>>>,
}

impl RemoteAuthMutexRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Number of live lock entries currently interned. Exposed for tests
    /// and diagnostics; not part of the locking contract.
    pub fn interned_count(&self) -> usize {
        self.locks.len()
    }

    fn get_or_create(&self, domain: &str) -> Arc<AsyncMutex<()>> {
        if let Some(existing) = self.locks.get(domain).and_then(|w| w.upgrade()) {
            return existing;
        }

        // Either absent or the weak ref expired; create fresh and replace.
        let lock = Arc::new(AsyncMutex::new(()));
        self.locks.insert(domain.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Acquire the lock for `domain` (creating it if necessary), run `f`
    /// while holding it, then release. Two concurrent calls for the same
    /// domain serialize; calls for distinct domains never block each other.
    ///
    /// `f` must not attempt to acquire any other remote's lock, or deadlock
    /// becomes possible if call order differs across tasks.
    pub async fn with_remote_lock<F, Fut, T>(&self, domain: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let lock = self.get_or_create(domain);
        let _guard = lock.lock().await;
        let result = f().await;
        drop(_guard);

        // Reclaim the entry if we were the last strong holder.
        if Arc::strong_count(&lock) == 1 {
            self.locks.remove_if(domain, |_, w| {
                w.upgrade().map(|a| Arc::ptr_eq(&a, &lock)).unwrap_or(true)
            });
        }
        drop(lock);

        result
    }
}

impl Default for RemoteAuthMutexRegistry {
    fn default() -> Self {
        Self::new()
    }
}
