// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Field gateway for a simulated solar inverter
//!
//! The gateway polls a remote inverter simulator at high frequency over a
//! Modbus-RTU-in-JSON HTTP API, buffers timestamped samples in a
//! fixed-capacity ring, compresses each upload window with a lossless
//! delta+RLE columnar codec, and posts a single HMAC-authenticated payload
//! per upload window. Upload responses piggyback runtime reconfiguration,
//! one-shot register writes, and firmware-over-the-air chunks, which the
//! gateway applies and acknowledges on subsequent uploads.

pub mod acquisition;
pub mod buffer;
pub mod clock;
pub mod codec;
pub mod config;
pub mod control;
pub mod daemon;
pub mod diag;
pub mod fota;
pub mod modbus;
pub mod security;
pub mod store;
pub mod transport;
pub mod uplink;
