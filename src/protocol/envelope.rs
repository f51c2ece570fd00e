// src/protocol/envelope.rs

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::headers;
use super::keys::KeySlot;
use super::ProtocolError;

const AES_KEY_LEN: usize = 32;
const GCM_IV_LEN: usize = 12;
const NONCE_LEN: usize = 16;

/// Wire form: which slots were used plus the hex ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub ei: usize,
    pub si: usize,
    pub ivi: usize,
    pub msg: String,
}

#[derive(Serialize)]
struct SealedBody<'a> {
    pl: &'a Value,
    nc: &'a str,
    ts: i64,
    sig: &'a str,
}

#[derive(Deserialize)]
struct RawBody {
    #[serde(default)]
    pl: Value,
    nc: Option<String>,
    ts: Option<i64>,
    #[serde(default)]
    sig: String,
}

/// Decrypted, parsed, not yet authenticated body.
#[derive(Debug)]
pub struct Opened {
    pub pl: Value,
    pub nc: String,
    pub ts: i64,
    pub sig: String,
}

/// Encrypts and signs `payload` with slots picked uniformly at random
/// (with replacement) from `slots`.
pub fn seal(slots: &[KeySlot], payload: &Value, now: i64) -> Result<Envelope, ProtocolError> {
    if slots.is_empty() {
        return Err(ProtocolError::NoKeySlots(String::new()));
    }

    let mut rng = rand::thread_rng();
    let ei = rng.gen_range(0..slots.len());
    let si = rng.gen_range(0..slots.len());
    let ivi = rng.gen_range(0..slots.len());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce_bytes);
    let nc = hex::encode(nonce_bytes);

    let sig = headers::sign(slots[si].bytes(), &nc, now, payload);
    let body = SealedBody { pl: payload, nc: &nc, ts: now, sig: &sig };
    let plaintext = serde_json::to_vec(&body).map_err(|e| ProtocolError::Serialize(e.to_string()))?;

    let cipher = cipher_for(slots, ei)?;
    let iv = iv_for(slots, ivi)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(iv), plaintext.as_ref())
        .map_err(|_| ProtocolError::Encrypt)?;

    Ok(Envelope { ei, si, ivi, msg: hex::encode(ciphertext) })
}

/// Range-checks the indices, decrypts and parses the body. Timestamp, replay
/// and signature checks are the caller's job since they need the cache.
pub fn open(slots: &[KeySlot], envelope: &Envelope) -> Result<Opened, ProtocolError> {
    for (field, index) in [("ei", envelope.ei), ("si", envelope.si), ("ivi", envelope.ivi)] {
        if index >= slots.len() {
            return Err(ProtocolError::IndexOutOfRange { field, index, len: slots.len() });
        }
    }

    let ciphertext = hex::decode(&envelope.msg).map_err(|_| ProtocolError::Decrypt)?;
    let cipher = cipher_for(slots, envelope.ei)?;
    let iv = iv_for(slots, envelope.ivi)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), ciphertext.as_ref())
        .map_err(|_| ProtocolError::Decrypt)?;

    let raw: RawBody =
        serde_json::from_slice(&plaintext).map_err(|e| ProtocolError::Parse(e.to_string()))?;
    let nc = raw.nc.filter(|nc| !nc.is_empty()).ok_or(ProtocolError::MissingNonce)?;
    let ts = raw.ts.ok_or(ProtocolError::MissingTimestamp)?;

    Ok(Opened { pl: raw.pl, nc, ts, sig: raw.sig })
}

fn cipher_for(slots: &[KeySlot], index: usize) -> Result<Aes256Gcm, ProtocolError> {
    let bytes = slots[index].bytes();
    if bytes.len() < AES_KEY_LEN {
        return Err(ProtocolError::KeySlotTooShort(index));
    }
    Aes256Gcm::new_from_slice(&bytes[..AES_KEY_LEN]).map_err(|_| ProtocolError::KeySlotTooShort(index))
}

fn iv_for(slots: &[KeySlot], index: usize) -> Result<&[u8], ProtocolError> {
    let bytes = slots[index].bytes();
    if bytes.len() < GCM_IV_LEN {
        return Err(ProtocolError::KeySlotTooShort(index));
    }
    Ok(&bytes[..GCM_IV_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn slots(n: usize) -> Vec<KeySlot> {
        (0..n).map(|i| KeySlot::from_text(&format!("slot-{i}"))).collect()
    }

    #[test]
    fn test_open_recovers_sealed_body() {
        let slots = slots(3);
        let env = seal(&slots, &json!({"a": 1}), 42).unwrap();
        assert!(env.ei < 3 && env.si < 3 && env.ivi < 3);

        let opened = open(&slots, &env).unwrap();
        assert_eq!(opened.pl, json!({"a": 1}));
        assert_eq!(opened.ts, 42);
        assert_eq!(opened.nc.len(), NONCE_LEN * 2);
        assert!(headers::verify(slots[env.si].bytes(), &opened.nc, 42, &opened.pl, &opened.sig).is_ok());
    }

    #[test]
    fn test_single_slot_reuses_index() {
        let slots = slots(1);
        let env = seal(&slots, &json!(null), 1).unwrap();
        assert_eq!((env.ei, env.si, env.ivi), (0, 0, 0));
    }

    #[test]
    fn test_tampered_ciphertext_fails_decrypt() {
        let slots = slots(2);
        let mut env = seal(&slots, &json!("x"), 1).unwrap();
        let flipped = if env.msg.ends_with('0') { '1' } else { '0' };
        env.msg.pop();
        env.msg.push(flipped);
        assert_eq!(open(&slots, &env).unwrap_err(), ProtocolError::Decrypt);
    }

    #[test]
    fn test_body_without_nonce_is_rejected() {
        let slots = slots(1);
        let cipher = cipher_for(&slots, 0).unwrap();
        let iv = iv_for(&slots, 0).unwrap();
        let body = br#"{"pl":{},"ts":5,"sig":""}"#;
        let ct = cipher.encrypt(Nonce::from_slice(iv), body.as_ref()).unwrap();
        let env = Envelope { ei: 0, si: 0, ivi: 0, msg: hex::encode(ct) };

        assert_eq!(open(&slots, &env).unwrap_err(), ProtocolError::MissingNonce);
    }

    #[test]
    fn test_non_json_body_is_parse_error() {
        let slots = slots(1);
        let cipher = cipher_for(&slots, 0).unwrap();
        let iv = iv_for(&slots, 0).unwrap();
        let ct = cipher.encrypt(Nonce::from_slice(iv), b"not json".as_ref()).unwrap();
        let env = Envelope { ei: 0, si: 0, ivi: 0, msg: hex::encode(ct) };

        assert!(matches!(open(&slots, &env), Err(ProtocolError::Parse(_))));
    }

    #[test]
    fn test_short_slot_is_refused() {
        let slots = vec![KeySlot::new(vec![1, 2, 3], "short".to_string())];
        assert_eq!(
            seal(&slots, &json!({}), 1).unwrap_err(),
            ProtocolError::KeySlotTooShort(0)
        );
    }
}
