// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Core gateway identity and timing configuration

use serde::{Deserialize, Serialize};

/// Identity and loop timing of the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Device identifier embedded in every upload payload.
    pub device_id: String,

    /// Upload window length in seconds.
    ///
    /// Nominally 900 (15 minutes) in production; test deployments use 15.
    pub upload_interval_sec: u64,

    /// Initial sampling period in milliseconds; the cloud may change it at
    /// runtime through `config_update`.
    pub sample_period_ms: u32,

    /// Ring buffer capacity in records. Sized to hold one upload window at
    /// the fastest expected sampling rate; older records are overwritten
    /// when acquisition outruns upload.
    pub buffer_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            device_id: "gw-0001".to_string(),
            upload_interval_sec: 900,
            sample_period_ms: 5000,
            buffer_capacity: 512,
        }
    }
}
