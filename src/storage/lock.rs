//! Named Lock Manager
//!
//! A process-wide set of non-blocking named permits. Objects that need
//! mutual exclusion live outside the process (LVM metadata, partition
//! tables), so there is no struct to hang a mutex on; instead callers take
//! a permit keyed by the volume name or by a well-known device key.

use crate::error::{Error, Result};
use dashmap::DashSet;
use std::sync::Arc;
use tracing::trace;

// =============================================================================
// Well-known Keys
// =============================================================================

/// Serializes VG membership changes (add/remove disk)
pub const DISK_MUTEX: &str = "local-storage/disk-mutex";

/// Key guarding the partition table of one disk
pub fn disk_key(device: &str) -> String {
    format!("{}:{}", DISK_MUTEX, device)
}

// =============================================================================
// Lock Manager
// =============================================================================

/// Set of held keys; at most one holder per key
#[derive(Debug, Default)]
pub struct LockManager {
    held: DashSet<String>,
}

impl LockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take `key` if free; never blocks
    pub fn try_acquire(&self, key: &str) -> bool {
        let acquired = self.held.insert(key.to_string());
        trace!(key, acquired, "try_acquire");
        acquired
    }

    /// Give `key` back; releasing a free key is a no-op
    pub fn release(&self, key: &str) {
        self.held.remove(key);
        trace!(key, "release");
    }

    /// Whether `key` is currently held by anyone
    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }

    /// Take `key` as an RAII guard, or fail with `Error::Aborted`
    pub fn lock(self: &Arc<Self>, key: impl Into<String>) -> Result<LockGuard> {
        let key = key.into();
        if self.try_acquire(&key) {
            Ok(LockGuard {
                manager: Arc::clone(self),
                key,
            })
        } else {
            Err(Error::Aborted { key })
        }
    }

    /// Number of held keys
    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

/// Releases its key on drop, covering every exit path
#[derive(Debug)]
pub struct LockGuard {
    manager: Arc<LockManager>,
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release(&self.key);
    }
}
