// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Inverter acquisition driver
//!
//! Wraps the Modbus codec and the HTTP transport into field-level reads and
//! the single supported write. Reads are grouped: adjacent register
//! addresses coalesce into one 0x03 request, and the full-map read falls
//! back to smaller groups when the wide read fails, so one bad register
//! does not blank the whole sample. Transport and protocol faults are
//! classified into the one-shot `sim_fault` sideband.

pub mod sample;

pub use sample::{FieldId, Sample, FIELD_ORDER};

use std::sync::Arc;

use log::{debug, info, warn};

use crate::diag::{Diagnostics, SimFault};
use crate::modbus::{self, ModbusError, SLAVE_ADDR};
use crate::transport::{FrameKind, InverterClient};

/// Register address of the export-power limit.
const EXPORT_POWER_REG: u16 = 8;

/// Field-level access to the simulated inverter.
pub struct InverterDriver {
    client: InverterClient,
    diag: Arc<Diagnostics>,
}

impl InverterDriver {
    pub fn new(client: InverterClient, diag: Arc<Diagnostics>) -> Self {
        InverterDriver { client, diag }
    }

    /// Read `count` holding registers starting at `addr` as one request.
    ///
    /// Classifies failures: no reply is a transport timeout, an exception
    /// frame carries its Modbus code, anything else is a malformed response.
    /// Each failed group advances the acquisition failure counters.
    pub async fn read_group(&self, addr: u16, count: u16) -> Option<Vec<u16>> {
        let request = modbus::make_read_holding(SLAVE_ADDR, addr, count);
        let Some(reply) = self.client.post_frame(FrameKind::Read, &request).await else {
            warn!("blank read response [addr={addr} cnt={count}]");
            self.diag.set_sim_fault(SimFault::Timeout);
            self.diag.record_read_failure();
            return None;
        };

        match modbus::parse_read_response(&reply) {
            Ok((slave, func, regs)) => {
                if slave != SLAVE_ADDR || func != modbus::FUNC_READ_HOLDING {
                    warn!("unexpected header slave=0x{slave:02X} func=0x{func:02X}");
                    self.diag.set_sim_fault(SimFault::MalformedResponse);
                    self.diag.record_read_failure();
                    return None;
                }
                if regs.len() != count as usize {
                    warn!(
                        "register count mismatch: got {} want {count} [addr={addr}]",
                        regs.len()
                    );
                    self.diag.set_sim_fault(SimFault::MalformedResponse);
                    self.diag.record_read_failure();
                    return None;
                }
                self.diag.record_read_success();
                Some(regs)
            }
            Err(ModbusError::ExceptionFrame) => {
                if let Ok((_, _, code)) = modbus::parse_exception_response(&reply) {
                    warn!(
                        "Modbus exception 0x{code:02X} ({}) [addr={addr} cnt={count}]",
                        modbus::exception_name(code)
                    );
                    self.diag.set_sim_fault(SimFault::Exception(code));
                } else {
                    self.diag.set_sim_fault(SimFault::MalformedResponse);
                }
                self.diag.record_read_failure();
                None
            }
            Err(e) => {
                warn!("malformed read response [addr={addr} cnt={count}]: {e}");
                self.diag.set_sim_fault(SimFault::MalformedResponse);
                self.diag.record_read_failure();
                None
            }
        }
    }

    /// Read the full register map, preferring one wide request.
    ///
    /// Returns `None` only when every group failed.
    pub async fn read_all(&self) -> Option<Sample> {
        let mut out = Sample::default();
        if let Some(regs) = self.read_group(0, 10).await {
            for (i, v) in regs.iter().enumerate() {
                if let Some(id) = FieldId::from_register(i as u16) {
                    out.set_field(id, *v);
                }
            }
            debug!("sample: {}", out.scaled_summary());
            return Some(out);
        }

        // wide read failed: fall back to smaller groups
        let mut ok_any = false;
        for (addr, count) in [(0u16, 2u16), (2, 1), (3, 2), (5, 3), (8, 1), (9, 1)] {
            if let Some(regs) = self.read_group(addr, count).await {
                ok_any = true;
                for (k, v) in regs.iter().enumerate() {
                    if let Some(id) = FieldId::from_register(addr + k as u16) {
                        out.set_field(id, *v);
                    }
                }
            }
        }
        ok_any.then_some(out)
    }

    /// Read only the selected fields, coalescing adjacent register
    /// addresses into the minimum number of grouped reads.
    ///
    /// The caller passes a deduplicated, sorted field set. Returns `None`
    /// only when every group failed.
    pub async fn read_selected(&self, fields: &[FieldId]) -> Option<Sample> {
        if fields.is_empty() {
            return None;
        }
        if fields.len() == FieldId::ALL.len() {
            return self.read_all().await;
        }

        let mut out = Sample::default();
        let mut ok_any = false;
        let mut i = 0;
        while i < fields.len() {
            let start = fields[i].register();
            let mut count: u16 = 1;
            let mut j = i + 1;
            while j < fields.len() && fields[j].register() == start + count {
                count += 1;
                j += 1;
            }
            if let Some(regs) = self.read_group(start, count).await {
                ok_any = true;
                for (k, v) in regs.iter().enumerate() {
                    if let Some(id) = FieldId::from_register(start + k as u16) {
                        out.set_field(id, *v);
                    }
                }
            }
            i = j;
        }
        ok_any.then_some(out)
    }

    /// Write the export-power limit (register 8), clamped to [0, 100].
    ///
    /// The write succeeded iff the slave echoed the request byte-identical.
    pub async fn set_export_power(&self, percent: i64, reason: &str) -> bool {
        let clamped = percent.clamp(0, 100) as u16;
        if i64::from(clamped) != percent {
            warn!("export power clamped to {clamped} from {percent}");
        }
        let request = modbus::make_write_single(SLAVE_ADDR, EXPORT_POWER_REG, clamped);
        let Some(reply) = self.client.post_frame(FrameKind::Write, &request).await else {
            warn!("write blank response (reason={reason})");
            return false;
        };
        if reply != request {
            if let Ok((_, _, code)) = modbus::parse_exception_response(&reply) {
                warn!(
                    "write exception 0x{code:02X} ({})",
                    modbus::exception_name(code)
                );
            } else {
                warn!("write echo mismatch: {reply}");
            }
            return false;
        }
        info!("set export power to {clamped}% ({reason})");
        true
    }
}
