// src/sys/secrets.rs

use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Literal secret used in local/dev deployments so tooling can predict it.
pub const LOCAL_SECRET: &str = "local";

/// InstanceSecret is the per-instance symmetric key for shim<->instance calls.
///
/// 1. It cannot be accidentally logged (`{:?}` prints `[REDACTED]`).
/// 2. The backing buffer is zeroized when the last clone drops.
#[derive(Clone)]
pub struct InstanceSecret {
    code: Arc<Secret<String>>,
}

impl InstanceSecret {
    pub fn new(code: String) -> Self {
        Self { code: Arc::new(Secret::new(code)) }
    }

    pub fn local() -> Self {
        Self::new(LOCAL_SECRET.to_string())
    }

    /// Fresh high-entropy secret: SHA-256 over the current timestamp and 32 random bytes.
    pub fn generate() -> Self {
        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut hasher = Sha256::new();
        hasher.update(chrono::Utc::now().timestamp_millis().to_string().as_bytes());
        hasher.update(salt);
        Self::new(hex::encode(hasher.finalize()))
    }

    /// Exposes the secret for the duration of `action` only.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        action(self.code.expose_secret().as_str())
    }
}

impl fmt::Debug for InstanceSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InstanceSecret([REDACTED])")
    }
}

/// PEM private key for a TLS domain. Persisted with the instance record, but
/// redacted in `Debug` and only readable through `use_secret`.
#[derive(Clone)]
pub struct PrivateKey {
    pem: Arc<Secret<String>>,
}

impl PrivateKey {
    pub fn new(pem: String) -> Self {
        Self { pem: Arc::new(Secret::new(pem)) }
    }

    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        action(self.pem.expose_secret().as_str())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.pem.expose_secret() == other.pem.expose_secret()
    }
}

impl Eq for PrivateKey {}

impl Serialize for PrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.use_secret(|pem| serializer.serialize_str(pem))
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(PrivateKey::new)
    }
}
