// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Minimal HMAC-signed dashboard tokens.
//!
//! Wire format: `base64url(JSON payload) + "." + hex(HMAC-SHA256)[..32]`.
//! The payload carries `sub`, `iat`, and `exp` (unix seconds). Signature
//! comparison is constant-time.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Truncated signature length in hex characters (128 bits).
const SIG_HEX_LEN: usize = 32;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

fn sign(secret: &str, data: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(data);
    let full = hex::encode(mac.finalize().into_bytes());
    full[..SIG_HEX_LEN].to_string()
}

/// Mint a token for `subject`, valid `expires_hours` from now.
pub fn create_token(secret: &str, subject: &str, expires_hours: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let payload = json!({
        "sub": subject,
        "iat": now,
        "exp": now + expires_hours * 3600,
    });
    // Keys are serialized in sorted order by the Value map, so the signed
    // bytes are stable across mints.
    let data = payload.to_string();
    let sig = sign(secret, data.as_bytes());
    format!("{}.{}", B64.encode(data.as_bytes()), sig)
}

/// Verify a token: signature (constant-time) and expiry. Returns the
/// payload on success.
pub fn verify_token(secret: &str, token: &str) -> Option<Value> {
    let (encoded, sig) = token.rsplit_once('.')?;
    let data = B64.decode(encoded).ok()?;
    let expected = sign(secret, &data);
    if !bool::from(sig.as_bytes().ct_eq(expected.as_bytes())) {
        return None;
    }
    let payload: Value = serde_json::from_slice(&data).ok()?;
    let exp = payload["exp"].as_i64()?;
    if exp < chrono::Utc::now().timestamp() {
        return None;
    }
    Some(payload)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
