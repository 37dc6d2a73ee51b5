// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Authenticated envelope around every uplink and downlink body
//!
//! A body travels as `{"nonce": u64, "payload": base64(body), "mac":
//! hex(HMAC-SHA256(psk, "{nonce}.{payload_b64}"))}`. Nonces are strictly
//! monotonic per direction and persisted across resets, so a replayed or
//! reordered envelope verifies at most once.

use base64::prelude::*;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// On-wire envelope shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub nonce: u64,
    pub payload: String,
    pub mac: String,
}

fn mac_hex(psk: &str, msg: &str) -> String {
    // HMAC accepts keys of any length; new_from_slice cannot fail for SHA-256.
    let mut mac = HmacSha256::new_from_slice(psk.as_bytes()).expect("HMAC key of any length");
    mac.update(msg.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Case-insensitive hex comparison that always scans the full width.
fn eq_hex_ci(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x.to_ascii_lowercase() ^ y.to_ascii_lowercase()))
        == 0
}

/// Wrap `body` with the given nonce and pre-shared key.
///
/// The caller owns nonce discipline: increment the device nonce before every
/// wrap and persist it afterwards.
pub fn wrap(body: &str, psk: &str, nonce: u64) -> String {
    let payload = BASE64_STANDARD.encode(body);
    let mac = mac_hex(psk, &format!("{nonce}.{payload}"));
    serde_json::to_string(&Envelope {
        nonce,
        payload,
        mac,
    })
    .expect("envelope serialization is infallible")
}

/// Verify an envelope and return the inner body.
///
/// Returns `None` on parse failure, MAC mismatch, or a nonce at or below
/// `last_seen_nonce` (anti-replay). On success `last_seen_nonce` advances to
/// the envelope's nonce; the caller persists it. When `payload_is_b64` the
/// payload is base64-decoded to produce the body, otherwise it is returned
/// verbatim.
pub fn unwrap(
    envelope_json: &str,
    psk: &str,
    last_seen_nonce: &mut u64,
    payload_is_b64: bool,
) -> Option<String> {
    let env: Envelope = serde_json::from_str(envelope_json).ok()?;
    if env.payload.is_empty() || env.mac.is_empty() {
        return None;
    }

    let calc = mac_hex(psk, &format!("{}.{}", env.nonce, env.payload));
    if !eq_hex_ci(&calc, &env.mac) {
        return None;
    }

    if env.nonce <= *last_seen_nonce {
        return None;
    }
    *last_seen_nonce = env.nonce;

    if payload_is_b64 {
        let bin = BASE64_STANDARD.decode(&env.payload).ok()?;
        String::from_utf8(bin).ok()
    } else {
        Some(env.payload)
    }
}
