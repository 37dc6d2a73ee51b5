// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus RTU frame codec for the inverter link
//!
//! The inverter simulator speaks Modbus RTU framed as uppercase hex inside a
//! JSON transport (see [`crate::transport`]). This module builds and parses
//! those frames; it performs no I/O.
//!
//! Only the two function codes the gateway needs are supported:
//!
//! | Function | Name | Direction |
//! |----------|------|-----------|
//! | 0x03 | Read Holding Registers | poll of the measurement map |
//! | 0x06 | Write Single Register | export-power limit writes |
//!
//! ## Frame layouts (before hex encoding)
//!
//! - Read request: `[slave][0x03][addr_hi][addr_lo][count_hi][count_lo][crc_lo][crc_hi]`
//! - Write request: `[slave][0x06][reg_hi][reg_lo][val_hi][val_lo][crc_lo][crc_hi]`
//! - Read response: `[slave][0x03][byte_count][hi,lo ...][crc_lo][crc_hi]`
//! - Exception: `[slave][func|0x80][exc_code][crc_lo][crc_hi]`
//!
//! The CRC is the Modbus RTU CRC-16 (reflected polynomial 0xA001, initial
//! value 0xFFFF) serialized little-endian. Register words are big-endian.

use thiserror::Error;

/// Fixed slave address of the simulated inverter.
pub const SLAVE_ADDR: u8 = 0x11;

/// Function code: read holding registers.
pub const FUNC_READ_HOLDING: u8 = 0x03;

/// Function code: write single register.
pub const FUNC_WRITE_SINGLE: u8 = 0x06;

/// Errors produced while parsing a response frame.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ModbusError {
    /// Frame shorter than the minimal `slave + func + 1 + crc` layout.
    #[error("frame too short")]
    TooShort,
    /// Trailing CRC-16 does not match the frame contents.
    #[error("CRC mismatch")]
    CrcMismatch,
    /// The function byte has its MSB set; the frame is an exception reply.
    #[error("exception frame")]
    ExceptionFrame,
    /// The function code is not the one the caller expected.
    #[error("unexpected function code 0x{0:02X}")]
    UnexpectedFunction(u8),
    /// Declared byte count disagrees with the frame length.
    #[error("byte count mismatch")]
    ByteCountMismatch,
    /// Register payload length is odd.
    #[error("odd byte count")]
    OddByteCount,
    /// The frame is a normal reply, not an exception.
    #[error("not an exception frame")]
    NotAnException,
}

/// Compute the Modbus RTU CRC-16 over `data`.
///
/// Polynomial 0xA001 (reflected 0x8005), initial value 0xFFFF. The result is
/// appended to frames little-endian (low byte first).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Decode a hex string into bytes.
///
/// Tolerant by design: whitespace and non-hex characters are skipped, and a
/// dangling half-byte at the end is dropped. The simulator occasionally
/// space-separates frame bytes.
pub fn hex_to_bytes(hex: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(hex.len() / 2);
    let mut hi: Option<u8> = None;
    for c in hex.chars() {
        let v = match c.to_digit(16) {
            Some(v) => v as u8,
            None => continue,
        };
        match hi.take() {
            None => hi = Some(v),
            Some(h) => out.push((h << 4) | v),
        }
    }
    out
}

/// Encode bytes as uppercase hex, the framing the simulator expects.
pub fn bytes_to_hex(data: &[u8]) -> String {
    hex::encode_upper(data)
}

fn push_crc(buf: &mut Vec<u8>) {
    let c = crc16(buf);
    buf.push((c & 0xFF) as u8);
    buf.push((c >> 8) as u8);
}

/// Build a function 0x03 read request as a hex string.
pub fn make_read_holding(slave: u8, start_addr: u16, count: u16) -> String {
    let mut buf = Vec::with_capacity(8);
    buf.push(slave);
    buf.push(FUNC_READ_HOLDING);
    buf.extend_from_slice(&start_addr.to_be_bytes());
    buf.extend_from_slice(&count.to_be_bytes());
    push_crc(&mut buf);
    bytes_to_hex(&buf)
}

/// Build a function 0x06 single-register write request as a hex string.
///
/// A successful write is echoed byte-identical by the slave, so the caller
/// can compare the reply against the request it sent.
pub fn make_write_single(slave: u8, reg_addr: u16, value: u16) -> String {
    let mut buf = Vec::with_capacity(8);
    buf.push(slave);
    buf.push(FUNC_WRITE_SINGLE);
    buf.extend_from_slice(&reg_addr.to_be_bytes());
    buf.extend_from_slice(&value.to_be_bytes());
    push_crc(&mut buf);
    bytes_to_hex(&buf)
}

fn check_crc(bytes: &[u8]) -> Result<(), ModbusError> {
    if bytes.len() < 5 {
        return Err(ModbusError::TooShort);
    }
    let n = bytes.len();
    let given = u16::from(bytes[n - 2]) | (u16::from(bytes[n - 1]) << 8);
    if given != crc16(&bytes[..n - 2]) {
        return Err(ModbusError::CrcMismatch);
    }
    Ok(())
}

/// Parse a function 0x03 read response.
///
/// Returns `(slave, function, registers)` with registers decoded big-endian
/// per word. Fails on short frames, CRC mismatch, exception frames, a
/// function other than 0x03, or a byte count inconsistent with the frame.
pub fn parse_read_response(resp_hex: &str) -> Result<(u8, u8, Vec<u16>), ModbusError> {
    let bytes = hex_to_bytes(resp_hex);
    check_crc(&bytes)?;
    let slave = bytes[0];
    let func = bytes[1];
    if func & 0x80 != 0 {
        return Err(ModbusError::ExceptionFrame);
    }
    if func != FUNC_READ_HOLDING {
        return Err(ModbusError::UnexpectedFunction(func));
    }
    let byte_count = bytes[2] as usize;
    if 3 + byte_count + 2 != bytes.len() {
        return Err(ModbusError::ByteCountMismatch);
    }
    if byte_count % 2 != 0 {
        return Err(ModbusError::OddByteCount);
    }
    let regs = bytes[3..3 + byte_count]
        .chunks_exact(2)
        .map(|w| (u16::from(w[0]) << 8) | u16::from(w[1]))
        .collect();
    Ok((slave, func, regs))
}

/// Parse an exception response.
///
/// Returns `(slave, function, exception_code)`. Fails if the frame is short,
/// the CRC is wrong, or the function MSB is clear (a normal reply).
pub fn parse_exception_response(resp_hex: &str) -> Result<(u8, u8, u8), ModbusError> {
    let bytes = hex_to_bytes(resp_hex);
    check_crc(&bytes)?;
    let slave = bytes[0];
    let func = bytes[1];
    if func & 0x80 == 0 {
        return Err(ModbusError::NotAnException);
    }
    Ok((slave, func, bytes[2]))
}

/// Human-readable name for a Modbus exception code.
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge (processing delayed)",
        0x06 => "Slave Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Failed to Respond",
        _ => "Unknown Modbus exception",
    }
}
