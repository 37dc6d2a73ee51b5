// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Inverter simulator endpoint configuration

use serde::{Deserialize, Serialize};

/// Endpoint and retry policy for the Modbus-over-HTTP inverter link.
///
/// Inverter polls run at the sampling period, so the per-attempt timeout is
/// short and the backoff stays well under one period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InverterConfig {
    /// Base URL of the simulator, e.g. `http://127.0.0.1:8080`.
    pub base_url: String,

    /// Value sent verbatim in the `Authorization` header; empty disables
    /// the header.
    pub auth_token: String,

    /// Attempts per request (at least 1).
    pub retries: u32,

    /// Initial backoff between attempts in milliseconds.
    pub base_backoff_ms: u64,

    /// Backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,

    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for InverterConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            auth_token: String::new(),
            retries: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 2000,
            timeout_ms: 5000,
        }
    }
}
