// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Lossless delta+RLE columnar codec for upload windows
//!
//! Samples inside one upload window change slowly, so each field column is
//! stored as an absolute first value followed by an opcode stream of
//! zero-delta runs and signed 16-bit deltas. The block ends with a CRC32
//! over everything before it.
//!
//! ## `delta_rle_v1` wire format (little-endian multibyte integers)
//!
//! ```text
//! header (8 bytes):
//!   u8  version = 1
//!   u8  n_fields
//!   u16 n_samples
//!   u32 reserved = 0
//! first_row:
//!   n_fields x u16          absolute initial value per field
//! per_field_stream (n_fields concatenated streams):
//!   0x00 len(u8)            run of `len` zero-deltas
//!   0x01 d_lo d_hi          signed 16-bit delta applied to running value
//! trailer:
//!   u32 crc32_ieee over all preceding bytes
//! ```
//!
//! Deltas are stored modulo 2^16 and re-applied with wrapping arithmetic on
//! decode, so the round trip is exact for any input. An empty batch encodes
//! to header + CRC only.

use std::time::Instant;

use thiserror::Error;

use crate::acquisition::{FieldId, Sample};
use crate::buffer::Record;

/// Codec identifier carried in the upload payload.
pub const CODEC_NAME: &str = "delta_rle_v1";

/// Uncompressed footprint of one record: ten u16 words plus a u64 timestamp.
pub const BYTES_PER_RAW_SAMPLE: usize = 28;

const VERSION: u8 = 1;
const N_FIELDS: usize = 10;
const HEADER_LEN: usize = 8;
const TRAILER_LEN: usize = 4;
const OP_ZERO_RUN: u8 = 0x00;
const OP_DELTA: u8 = 0x01;

/// Decoder failure reasons.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Blob shorter than header + CRC, or an opcode stream runs past the
    /// payload end.
    #[error("truncated block")]
    Truncated,
    /// Version byte is not 1.
    #[error("unsupported version {0}")]
    BadVersion(u8),
    /// Opcode byte is neither a zero-run nor a delta.
    #[error("unknown opcode 0x{0:02X}")]
    BadOpcode(u8),
    /// A zero-run would produce more values than the header declares.
    #[error("run past end of column")]
    RunPastEnd,
    /// Trailing CRC32 does not match the block contents.
    #[error("CRC mismatch")]
    CrcMismatch,
}

/// Compression self-test result reported alongside each upload.
#[derive(Debug, Clone)]
pub struct BenchResult {
    /// Codec identifier.
    pub method: &'static str,
    /// Number of records in the batch.
    pub n_samples: usize,
    /// Raw footprint of the batch (`n_samples * 28`).
    pub orig_bytes: usize,
    /// Encoded block size.
    pub comp_bytes: usize,
    /// Encode wall time in milliseconds.
    pub encode_ms: f64,
    /// Whether decode reproduced the input exactly.
    pub lossless_ok: bool,
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Encode a batch of records into a `delta_rle_v1` block.
pub fn encode(records: &[Record]) -> Vec<u8> {
    let n = records.len() as u16;
    let mut out = Vec::with_capacity(HEADER_LEN + N_FIELDS * 2 + records.len());
    out.push(VERSION);
    out.push(N_FIELDS as u8);
    put_u16(&mut out, n);
    out.extend_from_slice(&0u32.to_le_bytes());

    if !records.is_empty() {
        let first = records[0].sample.as_words();
        for v in first {
            put_u16(&mut out, v);
        }

        for f in 0..N_FIELDS {
            let id = FieldId::ALL[f];
            let mut prev = first[f];
            let mut zero_run: u8 = 0;
            for rec in &records[1..] {
                let cur = rec.sample.field(id);
                let delta = cur.wrapping_sub(prev);
                if delta == 0 {
                    if zero_run == u8::MAX {
                        out.push(OP_ZERO_RUN);
                        out.push(zero_run);
                        zero_run = 0;
                    }
                    zero_run += 1;
                } else {
                    if zero_run > 0 {
                        out.push(OP_ZERO_RUN);
                        out.push(zero_run);
                        zero_run = 0;
                    }
                    out.push(OP_DELTA);
                    out.extend_from_slice(&delta.to_le_bytes());
                    prev = cur;
                }
            }
            if zero_run > 0 {
                out.push(OP_ZERO_RUN);
                out.push(zero_run);
            }
        }
    }

    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Decode a `delta_rle_v1` block back into samples.
///
/// Validates the CRC before touching the payload, then rejects unknown
/// opcodes and streams that run short of or past the declared sample count.
pub fn decode(blob: &[u8]) -> Result<Vec<Sample>, CodecError> {
    if blob.len() < HEADER_LEN + TRAILER_LEN {
        return Err(CodecError::Truncated);
    }
    let payload_end = blob.len() - TRAILER_LEN;
    let given = u32::from_le_bytes([
        blob[payload_end],
        blob[payload_end + 1],
        blob[payload_end + 2],
        blob[payload_end + 3],
    ]);
    if given != crc32fast::hash(&blob[..payload_end]) {
        return Err(CodecError::CrcMismatch);
    }

    if blob[0] != VERSION {
        return Err(CodecError::BadVersion(blob[0]));
    }
    let n_fields = blob[1] as usize;
    let n_samples = u16::from_le_bytes([blob[2], blob[3]]) as usize;
    let mut off = HEADER_LEN;

    if n_samples == 0 {
        return Ok(Vec::new());
    }
    if n_fields != N_FIELDS || payload_end < off + n_fields * 2 {
        return Err(CodecError::Truncated);
    }

    let mut columns = vec![vec![0u16; n_samples]; n_fields];
    let mut last = [0u16; N_FIELDS];
    for (f, col) in columns.iter_mut().enumerate() {
        last[f] = u16::from_le_bytes([blob[off], blob[off + 1]]);
        col[0] = last[f];
        off += 2;
    }

    for (f, col) in columns.iter_mut().enumerate() {
        let mut produced = 0usize;
        while produced < n_samples - 1 {
            if off >= payload_end {
                return Err(CodecError::Truncated);
            }
            let op = blob[off];
            off += 1;
            match op {
                OP_ZERO_RUN => {
                    if off >= payload_end {
                        return Err(CodecError::Truncated);
                    }
                    let len = blob[off] as usize;
                    off += 1;
                    if produced + len > n_samples - 1 {
                        return Err(CodecError::RunPastEnd);
                    }
                    for _ in 0..len {
                        produced += 1;
                        col[produced] = last[f];
                    }
                }
                OP_DELTA => {
                    if off + 2 > payload_end {
                        return Err(CodecError::Truncated);
                    }
                    let delta = u16::from_le_bytes([blob[off], blob[off + 1]]);
                    off += 2;
                    let cur = last[f].wrapping_add(delta);
                    produced += 1;
                    col[produced] = cur;
                    last[f] = cur;
                }
                other => return Err(CodecError::BadOpcode(other)),
            }
        }
    }

    let mut samples = vec![Sample::default(); n_samples];
    for (f, col) in columns.iter().enumerate() {
        let id = FieldId::ALL[f];
        for (i, v) in col.iter().enumerate() {
            samples[i].set_field(id, *v);
        }
    }
    Ok(samples)
}

/// Encode the batch, time it, then decode and compare as a self-test.
///
/// The encoder is the source of truth: a failed round trip is reported in
/// `lossless_ok` but does not keep the block off the wire.
pub fn run_benchmark(records: &[Record]) -> BenchResult {
    let mut result = BenchResult {
        method: CODEC_NAME,
        n_samples: records.len(),
        orig_bytes: records.len() * BYTES_PER_RAW_SAMPLE,
        comp_bytes: 0,
        encode_ms: 0.0,
        lossless_ok: true,
    };
    if records.is_empty() {
        return result;
    }

    let t0 = Instant::now();
    let blob = encode(records);
    result.encode_ms = t0.elapsed().as_secs_f64() * 1000.0;
    result.comp_bytes = blob.len();

    match decode(&blob) {
        Ok(decoded) => {
            result.lossless_ok = decoded.len() == records.len()
                && decoded
                    .iter()
                    .zip(records.iter())
                    .all(|(d, r)| *d == r.sample);
        }
        Err(_) => result.lossless_ok = false,
    }
    result
}
