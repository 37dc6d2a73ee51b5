// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Firmware update storage configuration

use serde::{Deserialize, Serialize};

/// Location of the dual-bank image store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FotaConfig {
    /// Directory holding the two image banks and the boot-state file.
    pub platform_dir: String,
}

impl Default for FotaConfig {
    fn default() -> Self {
        Self {
            platform_dir: "fota-banks".to_string(),
        }
    }
}
