// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration management for the gateway
//!
//! The configuration is a YAML file with one section per concern. Every
//! section has defaults, so a minimal file (or none at all) yields a
//! runnable development setup; a missing file is replaced by a default one
//! on first start so the operator has something to edit.
//!
//! ## Sections
//!
//! - `gateway`: device identity, upload window, sampling period, buffer size
//! - `inverter`: simulator endpoint and retry policy
//! - `cloud`: collector endpoint and retry policy
//! - `security`: pre-shared key and envelope switch
//! - `network`: Wi-Fi/NTP provisioning (bring-up preconditions, logged only)
//! - `fota`: dual-bank image store location
//! - `storage`: persistent key-value snapshot location

pub mod cloud;
pub mod fota;
pub mod gateway;
pub mod inverter;
pub mod network;
pub mod security;
pub mod storage;

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

pub use cloud::CloudConfig;
pub use fota::FotaConfig;
pub use gateway::GatewayConfig;
pub use inverter::InverterConfig;
pub use network::NetworkConfig;
pub use security::SecurityConfig;
pub use storage::StorageConfig;

/// Root configuration structure.
///
/// Deserialized from YAML with serde; every section falls back to its
/// default when absent so partial files stay valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device identity and loop timing.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Inverter simulator endpoint.
    #[serde(default)]
    pub inverter: InverterConfig,

    /// Cloud collector endpoint.
    #[serde(default)]
    pub cloud: CloudConfig,

    /// Envelope key material.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Network bring-up provisioning.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Firmware update storage.
    #[serde(default)]
    pub fota: FotaConfig,

    /// Persistent store location.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// A missing file is created with defaults and the defaults returned,
    /// so a first start on a clean host is self-provisioning.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("configuration file not found at {:?}, creating default", path);
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        debug!("loading configuration from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file at {:?}", path))?;
        let config: Config = serde_yml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML configuration from {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to a YAML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml =
            serde_yml::to_string(self).context("failed to serialize configuration to YAML")?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("failed to write configuration to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Cross-field validation beyond what serde can express.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.device_id.is_empty() {
            bail!("gateway.device_id must not be empty");
        }
        if self.gateway.upload_interval_sec == 0 {
            bail!("gateway.upload_interval_sec must be positive");
        }
        if self.gateway.sample_period_ms == 0 {
            bail!("gateway.sample_period_ms must be positive");
        }
        if self.gateway.buffer_capacity == 0 {
            bail!("gateway.buffer_capacity must be positive");
        }
        for (name, url) in [
            ("inverter.base_url", &self.inverter.base_url),
            ("cloud.base_url", &self.cloud.base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("{name} must start with http:// or https://");
            }
        }
        if self.inverter.retries == 0 || self.cloud.retries == 0 {
            bail!("retry counts must be at least 1");
        }
        Ok(())
    }

    /// Apply command line overrides.
    ///
    /// Only values that were explicitly provided replace the file contents.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_args(
        &mut self,
        device_id: Option<String>,
        inverter_url: Option<String>,
        cloud_url: Option<String>,
        upload_interval_sec: Option<u64>,
        sample_period_ms: Option<u32>,
        psk: Option<String>,
        no_envelope: bool,
    ) {
        if let Some(device_id) = device_id {
            debug!("overriding gateway.device_id from command line");
            self.gateway.device_id = device_id;
        }
        if let Some(url) = inverter_url {
            debug!("overriding inverter.base_url from command line");
            self.inverter.base_url = url;
        }
        if let Some(url) = cloud_url {
            debug!("overriding cloud.base_url from command line");
            self.cloud.base_url = url;
        }
        if let Some(interval) = upload_interval_sec {
            debug!("overriding gateway.upload_interval_sec from command line");
            self.gateway.upload_interval_sec = interval;
        }
        if let Some(period) = sample_period_ms {
            debug!("overriding gateway.sample_period_ms from command line");
            self.gateway.sample_period_ms = period;
        }
        if let Some(psk) = psk {
            debug!("overriding security.psk from command line");
            self.security.psk = psk;
        }
        if no_envelope {
            debug!("disabling the security envelope from command line");
            self.security.use_envelope = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let config = Config::from_file(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.gateway.upload_interval_sec, 900);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "gateway:\n  device_id: test-gw\n  upload_interval_sec: 15\n  sample_period_ms: 1000\n  buffer_capacity: 64\n",
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.gateway.device_id, "test-gw");
        assert_eq!(config.gateway.upload_interval_sec, 15);
        // untouched sections keep their defaults
        assert_eq!(config.inverter.retries, 3);
        assert!(config.security.use_envelope);
    }

    #[test]
    fn bad_url_is_rejected() {
        let mut config = Config::default();
        config.cloud.base_url = "ftp://nope".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn apply_args_overrides_only_provided_values() {
        let mut config = Config::default();
        config.apply_args(
            Some("cli-gw".to_string()),
            None,
            Some("http://cloud.example:9000".to_string()),
            Some(15),
            None,
            None,
            true,
        );
        assert_eq!(config.gateway.device_id, "cli-gw");
        assert_eq!(config.cloud.base_url, "http://cloud.example:9000");
        assert_eq!(config.gateway.upload_interval_sec, 15);
        assert_eq!(config.gateway.sample_period_ms, 5000);
        assert!(!config.security.use_envelope);
    }
}
