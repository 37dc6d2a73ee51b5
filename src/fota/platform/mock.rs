// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! In-memory platform for exercising the FOTA engine in tests
//!
//! Mirrors the file platform's observable behavior and adds failure
//! injection knobs so the engine's error taxonomy can be driven directly.

use anyhow::{bail, Result};

use super::{BootState, OtaPlatform};

/// In-memory dual-bank mock with failure injection.
#[derive(Default)]
pub struct MockOtaPlatform {
    /// Contents of the inactive bank being written.
    pub bank: Vec<u8>,
    writer_open: bool,
    boot_state: BootStateFlags,
    reset_requested: bool,

    /// Make the next `begin` fail.
    pub fail_begin: bool,
    /// Make every `write` fail.
    pub fail_write: bool,
    /// Make `end` fail.
    pub fail_end: bool,
    /// Make `set_boot_target` fail.
    pub fail_set_boot: bool,
}

#[derive(Default)]
struct BootStateFlags {
    pending_verify: Option<String>,
    rolled_back: Option<String>,
}

impl MockOtaPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the loader reverting after a failed boot of `version`.
    pub fn force_rollback(&mut self, version: &str) {
        self.boot_state.pending_verify = None;
        self.boot_state.rolled_back = Some(version.to_string());
    }
}

impl OtaPlatform for MockOtaPlatform {
    fn begin(&mut self, _size: u32, resume: bool) -> Result<()> {
        if self.fail_begin {
            bail!("injected begin failure");
        }
        if !resume {
            self.bank.clear();
        }
        self.writer_open = true;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.fail_write {
            bail!("injected write failure");
        }
        if !self.writer_open {
            bail!("no open update bank");
        }
        self.bank.extend_from_slice(data);
        Ok(())
    }

    fn read_back(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.bank.len() {
            bail!("bank read-back short");
        }
        buf.copy_from_slice(&self.bank[start..end]);
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if self.fail_end {
            bail!("injected end failure");
        }
        self.writer_open = false;
        Ok(())
    }

    fn set_boot_target(&mut self, version: &str) -> Result<()> {
        if self.fail_set_boot {
            bail!("injected set-boot failure");
        }
        self.boot_state.pending_verify = Some(version.to_string());
        self.boot_state.rolled_back = None;
        Ok(())
    }

    fn mark_app_valid_cancel_rollback(&mut self) -> Result<()> {
        self.boot_state.pending_verify = None;
        Ok(())
    }

    fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    fn take_reset_request(&mut self) -> bool {
        std::mem::take(&mut self.reset_requested)
    }

    fn boot_state(&self) -> BootState {
        if let Some(version) = &self.boot_state.rolled_back {
            return BootState::RolledBack {
                version: version.clone(),
            };
        }
        if let Some(version) = &self.boot_state.pending_verify {
            return BootState::PendingVerify {
                version: version.clone(),
            };
        }
        BootState::Normal
    }
}
