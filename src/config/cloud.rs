// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Cloud upload endpoint configuration

use serde::{Deserialize, Serialize};

/// Endpoint and retry policy for uploads and FOTA chunk fetches.
///
/// Upload bodies are much larger than inverter polls and FOTA chunks ride
/// on the same client, so the per-attempt timeout is longer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Base URL of the cloud collector, e.g. `http://127.0.0.1:9000`.
    pub base_url: String,

    /// Value sent verbatim in the `Authorization` header; empty disables
    /// the header.
    pub auth_token: String,

    /// Attempts per upload (at least 1).
    pub retries: u32,

    /// Initial backoff between attempts in milliseconds.
    pub base_backoff_ms: u64,

    /// Backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,

    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".to_string(),
            auth_token: String::new(),
            retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 8000,
            timeout_ms: 8000,
        }
    }
}
