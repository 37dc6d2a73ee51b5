// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Envelope security configuration

use serde::{Deserialize, Serialize};

/// Pre-shared key and envelope switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// HMAC-SHA256 key shared with the cloud.
    pub psk: String,

    /// When false, uploads and replies travel as raw JSON without the
    /// HMAC+nonce envelope. Development only.
    pub use_envelope: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            psk: "change-me".to_string(),
            use_envelope: true,
        }
    }
}
