// src/protocol/keys.rs

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// One entry of an instance's ordered key material list.
///
/// 🛡️ Debug output is redacted and both forms are wiped when the slot drops.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySlot {
    bytes: Vec<u8>,
    text: String,
}

impl KeySlot {
    pub fn new(bytes: Vec<u8>, text: String) -> Self {
        Self { bytes, text }
    }

    /// Derives the byte form as SHA-256 of the string form, which guarantees
    /// 32 bytes of key material regardless of how the license encodes lines.
    pub fn from_text(text: &str) -> Self {
        let bytes = Sha256::digest(text.as_bytes()).to_vec();
        Self { bytes, text: text.to_string() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Debug for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeySlot([REDACTED])")
    }
}

/// Instance id -> ordered key slots, as produced by license discovery.
#[derive(Default, Clone)]
pub struct KeyRing {
    slots: Arc<RwLock<HashMap<String, Arc<Vec<KeySlot>>>>>,
}

impl KeyRing {
    pub async fn set(&self, instance_id: &str, slots: Vec<KeySlot>) {
        self.slots
            .write()
            .await
            .insert(instance_id.to_string(), Arc::new(slots));
    }

    pub async fn get(&self, instance_id: &str) -> Option<Arc<Vec<KeySlot>>> {
        self.slots
            .read()
            .await
            .get(instance_id)
            .filter(|slots| !slots.is_empty())
            .cloned()
    }

    pub async fn remove(&self, instance_id: &str) {
        self.slots.write().await.remove(instance_id);
    }

    /// One-shot load of `<dir>/<instance id>.license`, one slot per non-empty line.
    /// Returns how many instances received key material.
    pub async fn load_dir(&self, dir: &Path) -> std::io::Result<usize> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %dir.display(), "License directory missing, no key slots loaded");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("license") {
                continue;
            }
            let Some(instance_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let raw = fs::read_to_string(&path).await?;
            let slots = parse_license(&raw);
            if slots.is_empty() {
                warn!(instance_id = %instance_id, "License file holds no key slots");
                continue;
            }
            info!(instance_id = %instance_id, slots = slots.len(), "Loaded license key slots");
            self.set(instance_id, slots).await;
            loaded += 1;
        }
        Ok(loaded)
    }
}

fn parse_license(raw: &str) -> Vec<KeySlot> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(KeySlot::from_text)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_debug_is_redacted() {
        let slot = KeySlot::from_text("super-secret-line");
        let rendered = format!("{:?}", slot);
        assert!(!rendered.contains("super-secret-line"));
        assert_eq!(slot.bytes().len(), 32);
    }

    #[tokio::test]
    async fn test_load_dir_reads_one_slot_per_line() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("abc123.license"), "one\n\n two \nthree\n")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();

        let ring = KeyRing::default();
        assert_eq!(ring.load_dir(dir.path()).await.unwrap(), 1);

        let slots = ring.get("abc123").await.unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[1].text(), "two");
    }

    #[tokio::test]
    async fn test_empty_slot_list_counts_as_missing() {
        let ring = KeyRing::default();
        ring.set("abc123", Vec::new()).await;
        assert!(ring.get("abc123").await.is_none());
    }
}
