//! Per-phone mutual exclusion.
//!
//! All read-modify-write cycles on one phone's session run under that phone's
//! lock. Different phones never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock table keyed by phone number.
#[derive(Default)]
pub struct PhoneLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held while a phone's session is being transitioned.
pub struct PhoneGuard {
    _guard: OwnedMutexGuard<()>,
}

impl PhoneLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `phone`.
    pub async fn acquire(&self, phone: &str) -> PhoneGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries nobody holds or waits on.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(phone.to_string()).or_default())
        };
        PhoneGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Number of phones with a live lock entry.
    pub fn active(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
