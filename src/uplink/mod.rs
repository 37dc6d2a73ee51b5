// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Upload cycle engine
//!
//! Once per upload window the uplink task promotes any staged
//! configuration, drains the ring, compresses and packages the batch,
//! merges staged sideband state, wraps the body in the security envelope,
//! posts it, and dispatches whatever the reply piggybacks: configuration
//! updates, one-shot register writes, and FOTA manifests and chunks.
//!
//! All mutable gateway state that crosses upload cycles lives here: the
//! envelope nonces, the FOTA engine, the staged acknowledgements and
//! command results. Only the uplink task touches it.

pub mod packetizer;

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use crate::acquisition::InverterDriver;
use crate::buffer::Ring;
use crate::clock::GatewayClock;
use crate::codec;
use crate::control::{self, CommandResult, ConfigAck, ControlPlane, PendingCommand};
use crate::diag::Diagnostics;
use crate::fota::{BootReport, FotaEngine, Manifest};
use crate::security;
use crate::store::KvStore;
use crate::transport::{self, CloudClient};

/// Identity and envelope settings of the uplink.
#[derive(Debug, Clone)]
pub struct UplinkSettings {
    pub device_id: String,
    pub psk: String,
    pub use_envelope: bool,
}

/// State machine driven once per upload window.
pub struct UplinkContext {
    settings: UplinkSettings,
    cloud: CloudClient,
    driver: Arc<InverterDriver>,
    ring: Arc<Ring>,
    clock: Arc<GatewayClock>,
    control: Arc<ControlPlane>,
    diag: Arc<Diagnostics>,
    store: Arc<KvStore>,
    fota: FotaEngine,

    device_nonce: u64,
    cloud_nonce: u64,
    seq: u64,
    upload_cycles: u64,

    staged_config_ack: Option<ConfigAck>,
    staged_command_result: Option<CommandResult>,
    pending_command: Option<PendingCommand>,
    staged_finalize_report: Option<(bool, bool)>,
    fota_progress_dirty: bool,
}

impl UplinkContext {
    /// Assemble the uplink state, restoring persisted nonces and running
    /// the FOTA boot handshake for the current image.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: UplinkSettings,
        cloud: CloudClient,
        driver: Arc<InverterDriver>,
        ring: Arc<Ring>,
        clock: Arc<GatewayClock>,
        control: Arc<ControlPlane>,
        diag: Arc<Diagnostics>,
        store: Arc<KvStore>,
        mut fota: FotaEngine,
    ) -> Self {
        let device_nonce = store.get_u64("sec", "nonce_device").unwrap_or(0);
        let cloud_nonce = store.get_u64("sec", "nonce_cloud").unwrap_or(0);
        fota.on_boot();
        UplinkContext {
            settings,
            cloud,
            driver,
            ring,
            clock,
            control,
            diag,
            store,
            fota,
            device_nonce,
            cloud_nonce,
            seq: 0,
            upload_cycles: 0,
            staged_config_ack: None,
            staged_command_result: None,
            pending_command: None,
            staged_finalize_report: None,
            fota_progress_dirty: false,
        }
    }

    /// Cloud connection status line for the heartbeat log.
    pub fn connection_status(&self) -> String {
        self.cloud.connection_status()
    }

    /// Read access to the FOTA engine (status surface for tests and logs).
    pub fn fota(&self) -> &FotaEngine {
        &self.fota
    }

    /// Run one full upload cycle.
    pub async fn run_cycle(&mut self) {
        self.upload_cycles += 1;

        // (1) promote a staged configuration at the window boundary
        if let Some(promoted) = self.control.promote() {
            info!(
                "runtime config promoted: interval={}ms fields={}",
                promoted.sampling_interval_ms,
                promoted.fields.len()
            );
        }

        // (2) atomic snapshot of the window
        let batch = self.ring.snapshot_and_clear();

        // (3) build the body, benchmarking the codec on real data
        let mut body = if batch.is_empty() {
            debug!("empty window, sending minimal body");
            packetizer::build_empty_payload(
                &self.settings.device_id,
                self.seq,
                self.clock.now_epoch_ms(),
            )
        } else {
            let bench = codec::run_benchmark(&batch);
            if bench.lossless_ok {
                info!(
                    "window of {} samples: {} -> {} bytes in {:.2} ms",
                    bench.n_samples, bench.orig_bytes, bench.comp_bytes, bench.encode_ms
                );
            } else {
                // firmware bug: the encoder is still the source of truth
                error!("codec self-test failed, block transmitted anyway");
            }
            let payload = packetizer::build_payload(&batch, &self.settings.device_id, self.seq);
            self.seq += 1;
            payload.body
        };

        // (4) merge staged sideband state
        self.merge_sidebands(&mut body);
        let body_str = body.to_string();

        // (5) envelope with a fresh device nonce
        let wire = if self.settings.use_envelope {
            self.device_nonce += 1;
            if let Err(e) = self.store.set_u64("sec", "nonce_device", self.device_nonce) {
                warn!("failed to persist device nonce: {e}");
            }
            security::wrap(&body_str, &self.settings.psk, self.device_nonce)
        } else {
            body_str
        };

        // (6) post with retry
        let Some(reply) = self.cloud.post_payload_and_get_reply(&wire).await else {
            self.diag.record_transport_failure();
            // keep the window's records for the next cycle
            self.ring.restore_front(batch);
            return;
        };

        // (7) verify the reply envelope; replays and forgeries are dropped
        let inner = if self.settings.use_envelope {
            match security::unwrap(&reply, &self.settings.psk, &mut self.cloud_nonce, true) {
                Some(inner) => {
                    if let Err(e) = self.store.set_u64("sec", "nonce_cloud", self.cloud_nonce) {
                        warn!("failed to persist cloud nonce: {e}");
                    }
                    inner
                }
                None => {
                    warn!("cloud reply failed envelope verification, ignoring");
                    return;
                }
            }
        } else {
            reply
        };

        // (8) dispatch piggybacked segments
        self.dispatch_reply(&inner).await;

        // (9) finalize a complete image; success resets the device
        if self.fota.finalize_ready() {
            let report = self.fota.finalize_and_apply();
            self.staged_finalize_report = Some(report);
            if self.fota.take_reset_request() {
                self.reboot();
                return;
            }
        }

        // (10) execute a staged command; result rides the next payload
        if let Some(cmd) = self.pending_command.take() {
            let ok = self.driver.set_export_power(cmd.export_pct, "cloud").await;
            self.staged_command_result = Some(CommandResult {
                success: ok,
                executed_at_ms: self.clock.now_epoch_ms(),
                value: cmd.export_pct,
            });
        }
    }

    /// Parse the inner reply JSON and hand each segment to its owner.
    ///
    /// Unknown keys are ignored; absent keys change nothing. When a
    /// manifest arrives without an embedded chunk, one chunk is fetched
    /// over GET using the authoritative `next_chunk`.
    pub async fn dispatch_reply(&mut self, inner: &str) {
        let parsed: Value = match serde_json::from_str(inner) {
            Ok(v) => v,
            Err(e) => {
                warn!("cloud reply is not JSON: {e}");
                return;
            }
        };

        let mut manifest_seen = false;
        let mut chunk_seen = false;

        if let Some(fota) = parsed.get("fota") {
            if let Some(manifest) = fota.get("manifest") {
                match serde_json::from_value::<Manifest>(manifest.clone()) {
                    Ok(m) => {
                        manifest_seen = true;
                        if let Err(e) = self.fota.start(m) {
                            warn!("FOTA start failed: {}", e.code());
                        }
                    }
                    Err(e) => warn!("unusable FOTA manifest: {e}"),
                }
            }
            if let (Some(number), Some(data)) = (
                fota.get("chunk_number").and_then(Value::as_u64),
                fota.get("data").and_then(Value::as_str),
            ) {
                chunk_seen = true;
                self.ingest_chunk(number as u32, data);
            }
        }

        if let Some(update) = parsed.get("config_update") {
            let current = self.control.current();
            let (next, ack) = control::reconcile(update, &current);
            if let Some(next) = next {
                match serde_json::to_string(&next) {
                    Ok(json) => {
                        if let Err(e) = self.store.set_str("cfg", "runtime", &json) {
                            warn!("failed to persist staged config: {e}");
                        }
                    }
                    Err(e) => warn!("failed to serialize staged config: {e}"),
                }
                self.control.stage(next);
            }
            info!(
                "config_update: accepted={:?} rejected={:?} unchanged={:?}",
                ack.accepted, ack.rejected, ack.unchanged
            );
            self.staged_config_ack = Some(ack);
        }

        if let Some(command) = parsed.get("command") {
            match control::parse_command(command, self.clock.now_epoch_ms()) {
                Some(cmd) => {
                    info!("command staged: write_register value={}", cmd.export_pct);
                    self.pending_command = Some(cmd);
                }
                None => warn!("unsupported command ignored: {command}"),
            }
        }

        // GET fallback: an active session with a manifest but no chunk in
        // this reply pulls exactly one chunk at the authoritative cursor.
        if manifest_seen && !chunk_seen && self.fota.is_active() {
            let next = self.fota.next_chunk_for_cloud();
            if let Some(data) = self
                .cloud
                .get_fota_chunk(&self.settings.device_id, next)
                .await
            {
                self.ingest_chunk(next, data.trim());
            }
        }
    }

    fn ingest_chunk(&mut self, number: u32, data_b64: &str) {
        match self.fota.ingest_chunk(number, data_b64) {
            Ok(()) => self.fota_progress_dirty = true,
            Err(e) => warn!("FOTA chunk #{number} rejected: {}", e.code()),
        }
    }

    /// Merge staged sideband sections into the upload body.
    fn merge_sidebands(&mut self, body: &mut Value) {
        let Some(root) = body.as_object_mut() else {
            return;
        };

        if let Some(result) = self.staged_command_result.take() {
            root.insert("command_result".to_string(), result.to_json());
        }

        let mut fota = Map::new();
        if self.fota_progress_dirty {
            self.fota_progress_dirty = false;
            // a session that finalized meanwhile reports verify/apply instead
            if self.fota.is_active() {
                let report = self.fota.status_report();
                fota.insert(
                    "progress".to_string(),
                    serde_json::json!({"written": report.written, "total": report.total}),
                );
            }
        }
        if let Some((verify_ok, apply_ok)) = self.staged_finalize_report.take() {
            fota.insert(
                "verify".to_string(),
                Value::from(if verify_ok { "ok" } else { "fail" }),
            );
            fota.insert(
                "apply".to_string(),
                Value::from(if apply_ok { "ok" } else { "fail" }),
            );
        }
        match self.fota.take_boot_report() {
            Some(BootReport::BootOk) => {
                fota.insert("boot_ok".to_string(), Value::from(true));
            }
            Some(BootReport::RolledBack { version }) => {
                fota.insert(
                    "failure".to_string(),
                    serde_json::json!({"reason": "boot_failed", "version": version}),
                );
            }
            None => {}
        }

        if let Some(ack) = self.staged_config_ack.take() {
            root.insert("config_ack".to_string(), ack.to_json());
        }
        if let Some(fault) = self.diag.take_sim_fault() {
            root.insert("sim_fault".to_string(), fault.to_json());
        }

        if let Some(err) = self.fota.take_staged_error() {
            fota.insert("error".to_string(), Value::from(err.code()));
        }
        if self.fota.is_active() {
            fota.insert(
                "next_chunk".to_string(),
                Value::from(self.fota.next_chunk_for_cloud()),
            );
        }
        if !fota.is_empty() {
            root.insert("fota".to_string(), Value::Object(fota));
        }

        root.insert(
            "power_stats".to_string(),
            serde_json::json!({
                "uptime_ms": self.clock.monotonic_ms(),
                "upload_cycles": self.upload_cycles,
            }),
        );
        root.insert(
            "diag".to_string(),
            self.diag.snapshot(
                self.ring.get_and_clear_dropped(),
                transport::connection_failures(),
            ),
        );
        let events = self.diag.drain_events();
        if !events.is_empty() {
            root.insert("events".to_string(), Value::from(events));
        }
    }

    /// Simulated device reset after a successful apply.
    ///
    /// On hardware the loader takes over here; the host build recycles the
    /// engine state and runs the post-boot handshake so the next upload
    /// carries `boot_ok` exactly once.
    fn reboot(&mut self) {
        info!("boot bank switched, restarting gateway runtime");
        self.fota.on_boot();
    }
}
