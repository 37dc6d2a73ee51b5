// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! HTTP transport to the inverter simulator and the cloud
//!
//! Both directions are plain JSON POSTs with a per-attempt timeout and a
//! bounded retry loop with exponential backoff. Inverter polls use a short
//! timeout; the upload POST and FOTA chunk GET get a longer one. A
//! process-wide connection-failure counter feeds the `diag` sideband.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{CloudConfig, InverterConfig};

/// Process-wide count of failed connection attempts (any endpoint).
static CONNECTION_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Read the process-wide connection-failure counter.
pub fn connection_failures() -> u64 {
    CONNECTION_FAILURES.load(Ordering::Relaxed)
}

fn note_connection_failure() {
    CONNECTION_FAILURES.fetch_add(1, Ordering::Relaxed);
}

/// Retry schedule: up to `retries` attempts, sleeping
/// `min(base_backoff_ms * 2^k, max_backoff_ms)` between them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Which inverter endpoint a frame goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Read,
    Write,
}

impl FrameKind {
    fn endpoint(self) -> &'static str {
        match self {
            FrameKind::Read => "/api/inverter/read",
            FrameKind::Write => "/api/inverter/write",
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// POST `body` to `url` with the given retry policy; returns the reply body
/// on HTTP 200 with non-empty content.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    auth_token: &str,
    body: String,
    timeout: Duration,
    policy: RetryPolicy,
) -> Option<String> {
    let attempts = policy.retries.max(1);
    for attempt in 0..attempts {
        let mut req = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .timeout(timeout);
        if !auth_token.is_empty() {
            req = req.header(reqwest::header::AUTHORIZATION, auth_token);
        }

        match req.send().await {
            Ok(response) if response.status().is_success() => {
                match response.text().await {
                    Ok(text) if !text.is_empty() => return Some(text),
                    Ok(_) => warn!("POST {url}: empty reply body"),
                    Err(e) => warn!("POST {url}: failed to read body: {e}"),
                }
            }
            Ok(response) => {
                warn!(
                    "POST {url} failed (attempt {}/{}): HTTP {}",
                    attempt + 1,
                    attempts,
                    response.status()
                );
            }
            Err(e) => {
                warn!("POST {url} failed (attempt {}/{}): {e}", attempt + 1, attempts);
            }
        }
        note_connection_failure();

        if attempt + 1 < attempts {
            tokio::time::sleep(policy.backoff(attempt)).await;
        }
    }
    None
}

/// Client for the Modbus-over-HTTP inverter endpoints.
pub struct InverterClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
    timeout: Duration,
    policy: RetryPolicy,
}

impl InverterClient {
    pub fn new(config: &InverterConfig) -> Self {
        InverterClient {
            client: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            auth_token: config.auth_token.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            policy: RetryPolicy {
                retries: config.retries,
                base_backoff_ms: config.base_backoff_ms,
                max_backoff_ms: config.max_backoff_ms,
            },
        }
    }

    /// Post a hex frame and extract the `frame` field of the JSON reply.
    ///
    /// Returns `None` after all retries fail or when the reply carries no
    /// usable frame.
    pub async fn post_frame(&self, kind: FrameKind, frame_hex: &str) -> Option<String> {
        let url = join_url(&self.base_url, kind.endpoint());
        let body = json!({ "frame": frame_hex }).to_string();
        let reply = post_with_retry(
            &self.client,
            &url,
            &self.auth_token,
            body,
            self.timeout,
            self.policy,
        )
        .await?;

        let parsed: serde_json::Value = match serde_json::from_str(&reply) {
            Ok(v) => v,
            Err(e) => {
                warn!("inverter reply is not JSON: {e}");
                return None;
            }
        };
        match parsed.get("frame").and_then(|f| f.as_str()) {
            Some(frame) if !frame.is_empty() => Some(frame.to_string()),
            _ => {
                warn!("no 'frame' in inverter reply");
                None
            }
        }
    }
}

/// Client for the cloud upload and FOTA chunk endpoints.
pub struct CloudClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
    timeout: Duration,
    policy: RetryPolicy,
    connection_status: Mutex<String>,
}

impl CloudClient {
    pub fn new(config: &CloudConfig) -> Self {
        CloudClient {
            client: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            auth_token: config.auth_token.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            policy: RetryPolicy {
                retries: config.retries,
                base_backoff_ms: config.base_backoff_ms,
                max_backoff_ms: config.max_backoff_ms,
            },
            connection_status: Mutex::new("Initializing".to_string()),
        }
    }

    /// Last known cloud connection status, for the heartbeat log.
    pub fn connection_status(&self) -> String {
        self.connection_status.lock().unwrap().clone()
    }

    fn set_status(&self, status: String) {
        *self.connection_status.lock().unwrap() = status;
    }

    /// Post an upload body (envelope or raw JSON) and return the reply body.
    pub async fn post_payload_and_get_reply(&self, body: &str) -> Option<String> {
        let url = join_url(&self.base_url, "/api/device/upload");
        let reply = post_with_retry(
            &self.client,
            &url,
            &self.auth_token,
            body.to_string(),
            self.timeout,
            self.policy,
        )
        .await;
        match &reply {
            Some(_) => {
                info!("POST {} -> ok ({} bytes sent)", url, body.len());
                self.set_status(format!(
                    "Connected - Last success: {}",
                    chrono::Local::now().to_rfc3339()
                ));
            }
            None => self.set_status("Error: upload failed after retries".to_string()),
        }
        reply
    }

    /// Fetch one base64 firmware chunk over GET, same retry strategy.
    pub async fn get_fota_chunk(&self, device_id: &str, chunk_number: u32) -> Option<String> {
        let url = join_url(
            &self.base_url,
            &format!("/api/fota/chunk?device={device_id}&chunk={chunk_number}"),
        );
        let attempts = self.policy.retries.max(1);
        for attempt in 0..attempts {
            let mut req = self.client.get(&url).timeout(self.timeout);
            if !self.auth_token.is_empty() {
                req = req.header(reqwest::header::AUTHORIZATION, self.auth_token.as_str());
            }
            match req.send().await {
                Ok(response) if response.status().is_success() => match response.text().await {
                    Ok(text) if !text.is_empty() => return Some(text),
                    Ok(_) => warn!("GET {url}: empty chunk body"),
                    Err(e) => warn!("GET {url}: failed to read body: {e}"),
                },
                Ok(response) => warn!(
                    "GET {url} failed (attempt {}/{}): HTTP {}",
                    attempt + 1,
                    attempts,
                    response.status()
                ),
                Err(e) => warn!("GET {url} failed (attempt {}/{}): {e}", attempt + 1, attempts),
            }
            note_connection_failure();
            if attempt + 1 < attempts {
                tokio::time::sleep(self.policy.backoff(attempt)).await;
            }
        }
        None
    }
}
