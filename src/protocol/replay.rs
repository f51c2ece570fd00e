// src/protocol/replay.rs

use std::collections::HashMap;

use tokio::sync::Mutex;

/// `(nonce, timestamp) -> expiry` latch.
///
/// Nonces are only unique per timestamp, so the pair is the key.
pub struct ReplayCache {
    entries: Mutex<HashMap<(String, i64), i64>>,
    ttl_ms: i64,
}

impl ReplayCache {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_ms,
        }
    }

    pub async fn is_consumed(&self, nonce: &str, ts: i64) -> bool {
        self.entries
            .lock()
            .await
            .contains_key(&(nonce.to_string(), ts))
    }

    /// Records the pair; returns `false` when it was already latched.
    pub async fn latch(&self, nonce: &str, ts: i64, now: i64) -> bool {
        let mut entries = self.entries.lock().await;
        let key = (nonce.to_string(), ts);
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, now + self.ttl_ms);
        true
    }

    /// Drops entries whose expiry has passed; returns how many were removed.
    pub async fn sweep(&self, now: i64) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, expiry| *expiry >= now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
