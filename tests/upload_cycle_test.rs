// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! End-to-end upload cycle tests against the in-process stub server
//!
//! Drives real cycles through the envelope, the HTTP client and the reply
//! dispatch: payload shape on the wire, config reconciliation and
//! promotion, command execution with the echo check, anti-replay on the
//! reply path, and window retention when the cloud is unreachable.

mod common;

use std::sync::Arc;

use base64::prelude::*;
use serde_json::json;

use solar_gateway::acquisition::{InverterDriver, Sample};
use solar_gateway::buffer::{Record, Ring};
use solar_gateway::clock::GatewayClock;
use solar_gateway::codec;
use solar_gateway::config::{CloudConfig, InverterConfig};
use solar_gateway::control::ControlPlane;
use solar_gateway::diag::Diagnostics;
use solar_gateway::fota::{FotaEngine, MockOtaPlatform};
use solar_gateway::security;
use solar_gateway::store::KvStore;
use solar_gateway::transport::{CloudClient, InverterClient};
use solar_gateway::uplink::{UplinkContext, UplinkSettings};

const PSK: &str = "integration-psk";

struct Harness {
    ctx: UplinkContext,
    ring: Arc<Ring>,
    control: Arc<ControlPlane>,
    store: Arc<KvStore>,
}

fn build_harness(cloud_url: &str, inverter_url: &str, use_envelope: bool) -> Harness {
    let ring = Arc::new(Ring::new(64));
    let clock = Arc::new(GatewayClock::new());
    let control = Arc::new(ControlPlane::default());
    let diag = Arc::new(Diagnostics::new());
    let store = Arc::new(KvStore::in_memory());

    let cloud = CloudClient::new(&CloudConfig {
        base_url: cloud_url.to_string(),
        auth_token: String::new(),
        retries: 1,
        base_backoff_ms: 1,
        max_backoff_ms: 2,
        timeout_ms: 2000,
    });
    let driver = Arc::new(InverterDriver::new(
        InverterClient::new(&InverterConfig {
            base_url: inverter_url.to_string(),
            auth_token: String::new(),
            retries: 1,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            timeout_ms: 2000,
        }),
        Arc::clone(&diag),
    ));
    let fota = FotaEngine::new(Box::new(MockOtaPlatform::new()), Arc::clone(&store));

    let ctx = UplinkContext::new(
        UplinkSettings {
            device_id: "itest-gw".to_string(),
            psk: PSK.to_string(),
            use_envelope,
        },
        cloud,
        driver,
        Arc::clone(&ring),
        clock,
        Arc::clone(&control),
        diag,
        Arc::clone(&store),
        fota,
    );
    Harness {
        ctx,
        ring,
        control,
        store,
    }
}

fn push_samples(ring: &Ring, n: u16) {
    for i in 0..n {
        ring.push(Record {
            epoch_ms: 1_000 + u64::from(i) * 5_000,
            sample: Sample {
                vac1: 2301,
                iac1: 152,
                fac1: 5000,
                pac: 7000 + i,
                ..Default::default()
            },
        });
    }
}

#[tokio::test]
async fn upload_round_trip_applies_config_and_command() {
    let mut stub = common::spawn_stub(PSK, true).await;
    let base = stub.base_url();
    let mut h = build_harness(&base, &base, true);

    push_samples(&h.ring, 3);
    stub.push_reply(json!({
        "config_update": {"sampling_interval": 2, "registers": ["voltage", "pac"]},
        "command": {"action": "write_register", "value": 50},
    }));

    h.ctx.run_cycle().await;

    // the first upload carries the compressed window
    let upload1 = stub.uploads.recv().await.unwrap();
    assert_eq!(upload1["device_id"], "itest-gw");
    assert_eq!(upload1["codec"], "delta_rle_v1");
    assert_eq!(upload1["orig_samples"], 3);
    assert_eq!(upload1["ts_start"], 1_000);
    assert_eq!(upload1["ts_end"], 11_000);
    let blob = BASE64_STANDARD
        .decode(upload1["block_b64"].as_str().unwrap())
        .unwrap();
    let decoded = codec::decode(&blob).unwrap();
    assert_eq!(decoded.len(), 3);
    assert_eq!(decoded[2].pac, 7002);
    assert!(upload1.get("power_stats").is_some());
    assert!(upload1.get("diag").is_some());
    // nothing staged yet
    assert!(upload1.get("config_ack").is_none());
    assert!(upload1.get("command_result").is_none());

    // the staged config must not take effect before the next boundary
    assert_eq!(h.control.current().sampling_interval_ms, 5000);

    h.ctx.run_cycle().await;

    // second upload: empty window, but acks and the command result ride it
    let upload2 = stub.uploads.recv().await.unwrap();
    assert_eq!(upload2["codec"], "none");
    let ack = &upload2["config_ack"];
    let accepted: Vec<&str> = ack["accepted"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(accepted.contains(&"sampling_interval"));
    assert!(accepted.contains(&"registers"));
    let result = &upload2["command_result"];
    assert_eq!(result["status"], "success");
    assert_eq!(result["value"], 50);

    // promotion happened at the top of the second cycle
    let promoted = h.control.current();
    assert_eq!(promoted.sampling_interval_ms, 2000);
    assert_eq!(promoted.fields.len(), 2);

    // accepted config was persisted for the next reset
    assert!(h.store.get_str("cfg", "runtime").is_some());

    // device nonce advanced and persisted once per upload
    assert_eq!(h.store.get_u64("sec", "nonce_device"), Some(2));
    // the server's nonces were accepted and persisted
    assert_eq!(h.store.get_u64("sec", "nonce_cloud"), Some(1002));
}

#[tokio::test]
async fn replayed_cloud_reply_is_ignored() {
    let mut stub = common::spawn_stub(PSK, true).await;
    let base = stub.base_url();
    let mut h = build_harness(&base, &base, true);

    stub.push_reply(json!({"command": {"action": "write_register", "value": 30}}));
    h.ctx.run_cycle().await;
    let _ = stub.uploads.recv().await.unwrap();

    // replay: a stale envelope whose nonce the device has already passed
    let stale = security::wrap(
        &json!({"command": {"action": "write_register", "value": 77}}).to_string(),
        PSK,
        500,
    );
    *stub.canned_envelope.lock().unwrap() = Some(stale);
    h.ctx.run_cycle().await;

    // the second upload still carries the first command's result
    let upload2 = stub.uploads.recv().await.unwrap();
    assert_eq!(upload2["command_result"]["value"], 30);

    // the replayed command must never execute: no result on the third upload
    h.ctx.run_cycle().await;
    let upload3 = stub.uploads.recv().await.unwrap();
    assert!(upload3.get("command_result").is_none());
}

#[tokio::test]
async fn unreachable_cloud_keeps_the_window() {
    // nothing listens on this port
    let mut h = build_harness("http://127.0.0.1:1", "http://127.0.0.1:1", true);
    push_samples(&h.ring, 5);

    h.ctx.run_cycle().await;

    // the drained window went back in front; nothing was lost
    assert_eq!(h.ring.len(), 5);
    let snap = h.ring.snapshot_and_clear();
    assert_eq!(snap[0].epoch_ms, 1_000);
    assert_eq!(snap[4].sample.pac, 7004);
}

#[tokio::test]
async fn development_mode_skips_the_envelope() {
    let mut stub = common::spawn_stub(PSK, false).await;
    let base = stub.base_url();
    let mut h = build_harness(&base, &base, false);

    push_samples(&h.ring, 1);
    stub.push_reply(json!({"command": {"action": "write_register", "value": 5}}));
    h.ctx.run_cycle().await;
    let upload1 = stub.uploads.recv().await.unwrap();
    assert_eq!(upload1["codec"], "delta_rle_v1");

    h.ctx.run_cycle().await;
    let upload2 = stub.uploads.recv().await.unwrap();
    assert_eq!(upload2["command_result"]["status"], "success");
    // no envelope: no nonces were consumed
    assert_eq!(h.store.get_u64("sec", "nonce_device"), None);
}
