// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Upload payload construction
//!
//! One payload per upload window: identity, window bounds, the per-record
//! timestamp list, and the base64 compressed block. An empty window still
//! produces a minimal `"codec":"none"` body so staged sideband state
//! (config acks, FOTA reports, diagnostics) reaches the cloud on time.

use base64::prelude::*;
use serde_json::{json, Value};

use crate::acquisition::FIELD_ORDER;
use crate::buffer::Record;
use crate::codec;

/// A built upload body plus the raw block size for logging.
#[derive(Debug, Clone)]
pub struct Payload {
    /// JSON body, before sideband merging and enveloping.
    pub body: Value,
    /// Size of the compressed block before base64.
    pub raw_block_bytes: usize,
}

/// Build the payload for a non-empty batch.
pub fn build_payload(records: &[Record], device_id: &str, seq: u64) -> Payload {
    debug_assert!(!records.is_empty());
    let blob = codec::encode(records);
    let raw_block_bytes = blob.len();
    let ts_list: Vec<u64> = records.iter().map(|r| r.epoch_ms).collect();

    let body = json!({
        "device_id": device_id,
        "ts_start": records[0].epoch_ms,
        "ts_end": records[records.len() - 1].epoch_ms,
        "seq": seq,
        "codec": codec::CODEC_NAME,
        "order": FIELD_ORDER,
        "ts_list": ts_list,
        "block_b64": BASE64_STANDARD.encode(&blob),
        "orig_samples": records.len(),
        "orig_bytes": records.len() * codec::BYTES_PER_RAW_SAMPLE,
    });
    Payload {
        body,
        raw_block_bytes,
    }
}

/// Build the minimal body for an empty window.
pub fn build_empty_payload(device_id: &str, seq: u64, now_epoch_ms: u64) -> Value {
    json!({
        "device_id": device_id,
        "ts_start": now_epoch_ms,
        "ts_end": now_epoch_ms,
        "seq": seq,
        "codec": "none",
        "order": [],
        "ts_list": [],
        "block_b64": "",
        "orig_samples": 0,
        "orig_bytes": 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::Sample;

    fn batch() -> Vec<Record> {
        (0..3)
            .map(|i| Record {
                epoch_ms: 1_000 + i * 5_000,
                sample: Sample {
                    vac1: 2301,
                    pac: 7000 + i as u16,
                    ..Default::default()
                },
            })
            .collect()
    }

    #[test]
    fn payload_carries_window_bounds_and_block() {
        let payload = build_payload(&batch(), "gw-1", 4);
        let body = &payload.body;
        assert_eq!(body["device_id"], "gw-1");
        assert_eq!(body["ts_start"], 1_000);
        assert_eq!(body["ts_end"], 11_000);
        assert_eq!(body["seq"], 4);
        assert_eq!(body["codec"], "delta_rle_v1");
        assert_eq!(body["order"].as_array().unwrap().len(), 10);
        assert_eq!(body["order"][0], "vac1");
        assert_eq!(body["ts_list"], json!([1_000, 6_000, 11_000]));
        assert_eq!(body["orig_samples"], 3);
        assert_eq!(body["orig_bytes"], 3 * codec::BYTES_PER_RAW_SAMPLE);

        // the block decodes back to the original samples
        let blob = BASE64_STANDARD
            .decode(body["block_b64"].as_str().unwrap())
            .unwrap();
        assert_eq!(blob.len(), payload.raw_block_bytes);
        let decoded = codec::decode(&blob).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[2].pac, 7002);
    }

    #[test]
    fn empty_window_body_is_minimal() {
        let body = build_empty_payload("gw-1", 9, 42_000);
        assert_eq!(body["codec"], "none");
        assert_eq!(body["order"], json!([]));
        assert_eq!(body["block_b64"], "");
        assert_eq!(body["ts_start"], 42_000);
        assert_eq!(body["seq"], 9);
        assert_eq!(body["orig_samples"], 0);
    }
}
