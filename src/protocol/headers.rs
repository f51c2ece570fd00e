// src/protocol/headers.rs

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;

use super::ProtocolError;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_IID: &str = "bcms-iid";
pub const HEADER_TS: &str = "bcms-ts";
pub const HEADER_NC: &str = "bcms-nc";
pub const HEADER_SIG: &str = "bcms-sig";

/// Flat HMAC channel: `bcms-ts`, `bcms-nc`, `bcms-sig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub ts: i64,
    pub nc: String,
    pub sig: String,
}

impl SignedHeaders {
    pub fn sign(secret: &[u8], payload: &Value, now: i64) -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let nc = hex::encode(nonce);
        let sig = sign(secret, &nc, now, payload);
        Self { ts: now, nc, sig }
    }

    pub fn pairs(&self) -> [(&'static str, String); 3] {
        [
            (HEADER_TS, self.ts.to_string()),
            (HEADER_NC, self.nc.clone()),
            (HEADER_SIG, self.sig.clone()),
        ]
    }

    /// Builds from any header source; missing or malformed headers are
    /// validation failures.
    pub fn from_lookup<'a, F>(lookup: F) -> Result<Self, ProtocolError>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let ts = lookup(HEADER_TS).ok_or(ProtocolError::MissingHeader(HEADER_TS))?;
        let ts = ts
            .trim()
            .parse::<i64>()
            .map_err(|_| ProtocolError::MalformedHeader(HEADER_TS))?;
        let nc = lookup(HEADER_NC)
            .filter(|v| !v.is_empty())
            .ok_or(ProtocolError::MissingHeader(HEADER_NC))?;
        let sig = lookup(HEADER_SIG)
            .filter(|v| !v.is_empty())
            .ok_or(ProtocolError::MissingHeader(HEADER_SIG))?;
        Ok(Self { ts, nc: nc.to_string(), sig: sig.to_string() })
    }
}

/// Hex HMAC-SHA256 over `nc + ts + JSON(payload)`.
pub fn sign(key: &[u8], nc: &str, ts: i64, payload: &Value) -> String {
    let mut mac = mac_for(key);
    mac.update(signed_string(nc, ts, payload).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time signature check.
pub fn verify(key: &[u8], nc: &str, ts: i64, payload: &Value, sig: &str) -> Result<(), ProtocolError> {
    let expected = hex::decode(sig).map_err(|_| ProtocolError::BadSignature)?;
    let mut mac = mac_for(key);
    mac.update(signed_string(nc, ts, payload).as_bytes());
    mac.verify_slice(&expected).map_err(|_| ProtocolError::BadSignature)
}

fn mac_for(key: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length, so this never fails.
    <HmacSha256 as Mac>::new_from_slice(key).unwrap_or_else(|_| unreachable!("hmac accepts any key length"))
}

fn signed_string(nc: &str, ts: i64, payload: &Value) -> String {
    format!("{nc}{ts}{payload}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_sign_then_verify() {
        let sig = sign(b"k", "abc", 7, &json!({"x": [1, 2]}));
        assert!(verify(b"k", "abc", 7, &json!({"x": [1, 2]}), &sig).is_ok());
        assert_eq!(
            verify(b"k", "abc", 8, &json!({"x": [1, 2]}), &sig),
            Err(ProtocolError::BadSignature)
        );
        assert_eq!(
            verify(b"k", "abc", 7, &json!({"x": [1, 2]}), "zz-not-hex"),
            Err(ProtocolError::BadSignature)
        );
    }

    #[test]
    fn test_from_lookup_round_trips_pairs() {
        let signed = SignedHeaders::sign(b"secret", &json!({}), 1_000);
        let map: HashMap<&str, String> = signed.pairs().into_iter().collect();
        let parsed = SignedHeaders::from_lookup(|name| map.get(name).map(String::as_str)).unwrap();
        assert_eq!(parsed, signed);
    }

    #[test]
    fn test_from_lookup_reports_missing_and_malformed() {
        let empty: HashMap<&str, &str> = HashMap::new();
        assert_eq!(
            SignedHeaders::from_lookup(|name| empty.get(name).copied()),
            Err(ProtocolError::MissingHeader(HEADER_TS))
        );

        let bad: HashMap<&str, &str> =
            [(HEADER_TS, "yesterday"), (HEADER_NC, "n"), (HEADER_SIG, "s")].into_iter().collect();
        assert_eq!(
            SignedHeaders::from_lookup(|name| bad.get(name).copied()),
            Err(ProtocolError::MalformedHeader(HEADER_TS))
        );
    }
}
