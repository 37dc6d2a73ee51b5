// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Network bring-up preconditions
//!
//! Wi-Fi association and the NTP exchange happen outside the core; these
//! values are carried for provisioning and logged at startup.

use serde::{Deserialize, Serialize};

/// Provisioning values for network bring-up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Wi-Fi station SSID.
    pub wifi_ssid: String,

    /// Wi-Fi station passphrase.
    pub wifi_pass: String,

    /// Epoch source host for clock sync.
    pub ntp_server: String,
}
