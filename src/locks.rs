//! Named resource locks for serialized system resources.
//!
//! Some system resources corrupt their state under concurrent writers; the
//! canonical example is the OS package manager database. Every module touching
//! such a resource acquires the same named mutex, held only for the duration
//! of the actual mutating call, never across an entire `configure()`.
//!
//! The registry is injected into modules by the orchestrator rather than
//! reached through shared mutable global state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Canonical lock name for the OS package manager.
pub const PACKAGE_MANAGER: &str = "package-manager";

/// Registry of named mutexes, created lazily on first use.
pub struct ResourceLockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResourceLockRegistry {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (or create) the lock for a resource name.
    pub fn lock_for(&self, name: &str) -> ResourceLock {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        let inner = locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        ResourceLock { inner }
    }

    /// Run `f` while holding the named lock. Keeps the critical section
    /// scoped to the mutating call.
    pub fn with_lock<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(name);
        let _guard = lock.acquire();
        f()
    }
}

impl Default for ResourceLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one named lock.
pub struct ResourceLock {
    inner: Arc<Mutex<()>>,
}

impl ResourceLock {
    /// Block until the resource is exclusively held.
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().expect("resource lock poisoned")
    }
}
