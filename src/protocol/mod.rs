//! Secure messaging between cloud, shim and instances.
//!
//! Two channels share one replay/timestamp policy:
//! - the multi-slot envelope (`ei/si/ivi/msg`): AES-256-GCM + HMAC-SHA256 with
//!   key material picked at random from the instance's license key slots;
//! - the flat signed headers (`bcms-ts/bcms-nc/bcms-sig`): HMAC only, keyed by the
//!   per-instance secret, for non-sensitive shim<->instance control calls.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub mod envelope;
pub mod headers;
pub mod keys;
pub mod replay;

pub use envelope::Envelope;
pub use headers::SignedHeaders;
pub use keys::{KeyRing, KeySlot};
pub use replay::ReplayCache;

/// Oldest accepted message age.
pub const MAX_MESSAGE_AGE_MS: i64 = 60_000;
/// Tolerated clock drift for messages stamped in the future.
pub const MAX_CLOCK_SKEW_MS: i64 = 3_000;
/// How long a consumed `(nonce, timestamp)` pair stays latched.
pub const REPLAY_TTL_MS: i64 = 60_000;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("no key slots registered for instance '{0}'")]
    NoKeySlots(String),

    #[error("key index {field}={index} out of range for {len} slots")]
    IndexOutOfRange {
        field: &'static str,
        index: usize,
        len: usize,
    },

    #[error("key slot {0} holds too little material")]
    KeySlotTooShort(usize),

    #[error("failed to encrypt payload")]
    Encrypt,

    #[error("failed to decrypt message")]
    Decrypt,

    #[error("message body is not valid JSON: {0}")]
    Parse(String),

    #[error("outbound payload cannot be serialized: {0}")]
    Serialize(String),

    #[error("missing nonce")]
    MissingNonce,

    #[error("missing timestamp")]
    MissingTimestamp,

    #[error("missing header '{0}'")]
    MissingHeader(&'static str),

    #[error("malformed header '{0}'")]
    MalformedHeader(&'static str),

    #[error("timestamp {ts} outside accepted window [{min}, {max}]")]
    TimestampOutOfWindow { ts: i64, min: i64, max: i64 },

    #[error("nonce already consumed")]
    Replay,

    #[error("signature mismatch")]
    BadSignature,
}

impl ProtocolError {
    /// Crypto failures (bad key index, decrypt, signature) as opposed to plain
    /// request validation failures. Both are rejected identically at the boundary.
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            ProtocolError::NoKeySlots(_)
                | ProtocolError::IndexOutOfRange { .. }
                | ProtocolError::KeySlotTooShort(_)
                | ProtocolError::Encrypt
                | ProtocolError::Decrypt
                | ProtocolError::BadSignature
        )
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Rejects timestamps older than 60s or more than 3s ahead of `now`.
pub fn check_window(ts: i64, now: i64) -> Result<(), ProtocolError> {
    let min = now - MAX_MESSAGE_AGE_MS;
    let max = now + MAX_CLOCK_SKEW_MS;
    if ts < min || ts > max {
        return Err(ProtocolError::TimestampOutOfWindow { ts, min, max });
    }
    Ok(())
}

/// Owner of the key ring and the replay cache. Every encode/decode in the shim
/// goes through here; nothing else touches the cache.
pub struct SecureMessaging {
    keys: KeyRing,
    replay: ReplayCache,
    shutdown: Arc<Notify>,
}

impl Default for SecureMessaging {
    fn default() -> Self {
        Self::new(KeyRing::default())
    }
}

impl SecureMessaging {
    pub fn new(keys: KeyRing) -> Self {
        Self {
            keys,
            replay: ReplayCache::new(REPLAY_TTL_MS),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn encode(&self, instance_id: &str, payload: &Value) -> Result<Envelope, ProtocolError> {
        self.encode_at(instance_id, payload, now_ms()).await
    }

    pub async fn encode_as<T: Serialize>(
        &self,
        instance_id: &str,
        payload: &T,
    ) -> Result<Envelope, ProtocolError> {
        let value = serde_json::to_value(payload).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
        self.encode(instance_id, &value).await
    }

    pub async fn encode_at(
        &self,
        instance_id: &str,
        payload: &Value,
        now: i64,
    ) -> Result<Envelope, ProtocolError> {
        let slots = self
            .keys
            .get(instance_id)
            .await
            .ok_or_else(|| ProtocolError::NoKeySlots(instance_id.to_string()))?;
        envelope::seal(&slots, payload, now)
    }

    pub async fn decode(&self, instance_id: &str, envelope: &Envelope) -> Result<Value, ProtocolError> {
        self.decode_at(instance_id, envelope, now_ms()).await
    }

    /// Decodes and then interprets the payload as `T`; the protocol layer itself
    /// never assumes a payload shape.
    pub async fn decode_as<T: DeserializeOwned>(
        &self,
        instance_id: &str,
        envelope: &Envelope,
    ) -> Result<T, ProtocolError> {
        let value = self.decode(instance_id, envelope).await?;
        serde_json::from_value(value).map_err(|e| ProtocolError::Parse(e.to_string()))
    }

    pub async fn decode_at(
        &self,
        instance_id: &str,
        envelope: &Envelope,
        now: i64,
    ) -> Result<Value, ProtocolError> {
        let slots = self
            .keys
            .get(instance_id)
            .await
            .ok_or_else(|| ProtocolError::NoKeySlots(instance_id.to_string()))?;

        let opened = envelope::open(&slots, envelope)?;
        check_window(opened.ts, now)?;
        if self.replay.is_consumed(&opened.nc, opened.ts).await {
            return Err(ProtocolError::Replay);
        }
        headers::verify(
            slots[envelope.si].bytes(),
            &opened.nc,
            opened.ts,
            &opened.pl,
            &opened.sig,
        )?;

        // Latching is the final gate; a concurrent twin that slipped past the
        // lookup above still loses here.
        if !self.replay.latch(&opened.nc, opened.ts, now).await {
            return Err(ProtocolError::Replay);
        }
        Ok(opened.pl)
    }

    /// Signs a payload for the flat header channel.
    pub fn sign_headers(&self, secret: &[u8], payload: &Value) -> SignedHeaders {
        SignedHeaders::sign(secret, payload, now_ms())
    }

    pub async fn verify_headers(
        &self,
        secret: &[u8],
        signed: &SignedHeaders,
        payload: &Value,
    ) -> Result<(), ProtocolError> {
        self.verify_headers_at(secret, signed, payload, now_ms()).await
    }

    pub async fn verify_headers_at(
        &self,
        secret: &[u8],
        signed: &SignedHeaders,
        payload: &Value,
        now: i64,
    ) -> Result<(), ProtocolError> {
        check_window(signed.ts, now)?;
        if self.replay.is_consumed(&signed.nc, signed.ts).await {
            return Err(ProtocolError::Replay);
        }
        headers::verify(secret, &signed.nc, signed.ts, payload, &signed.sig)?;
        if !self.replay.latch(&signed.nc, signed.ts, now).await {
            return Err(ProtocolError::Replay);
        }
        Ok(())
    }

    pub async fn sweep_replay_cache(&self) -> usize {
        self.replay.sweep(now_ms()).await
    }

    /// Runs the 1s replay-cache sweep until shutdown is signalled.
    pub async fn run_sweeper(&self) {
        info!(interval_ms = SWEEP_INTERVAL.as_millis() as u64, "Replay cache sweeper started");
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Replay cache sweeper received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    let removed = self.sweep_replay_cache().await;
                    if removed > 0 {
                        debug!(removed, "Pruned expired nonces");
                    }
                }
            }
        }
    }
}

/// Logs a rejected message without echoing any key material.
pub fn log_rejection(instance_id: &str, err: &ProtocolError) {
    if err.is_crypto() {
        warn!(instance_id = %instance_id, error = %err, "Rejected message: crypto check failed");
    } else {
        warn!(instance_id = %instance_id, error = %err, "Rejected message: validation failed");
    }
}
