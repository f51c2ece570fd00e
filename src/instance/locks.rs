// src/instance/locks.rs

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{Result, ShimError};

/// At most one lifecycle operation per instance id; a second caller is
/// rejected instead of queued.
#[derive(Default)]
pub struct OperationGuards {
    busy: Arc<Mutex<HashSet<String>>>,
}

impl OperationGuards {
    pub fn acquire(&self, id: &str) -> Result<BusyGuard> {
        let mut busy = self.busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !busy.insert(id.to_string()) {
            return Err(ShimError::Busy(id.to_string()));
        }
        Ok(BusyGuard { busy: self.busy.clone(), id: id.to_string() })
    }

    pub fn is_busy(&self, id: &str) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(id)
    }
}

/// Releases the id when dropped, including on error and cancellation.
pub struct BusyGuard {
    busy: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

/// Per-id mutual exclusion around data-category replacement.
#[derive(Default)]
pub struct DataLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DataLocks {
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn forget(&self, id: &str) {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
    }
}
