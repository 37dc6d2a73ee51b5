// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Dual-bank update platform abstraction
//!
//! The FOTA engine is a pure state machine; everything that touches an
//! actual image store goes through this trait. Two implementations:
//! - File: two bank files plus a boot-state file under a directory
//! - Mock: in-memory banks for tests
//!
//! The boot handshake works in two halves. `set_boot_target` +
//! `request_reset` hand the new image to the loader; on the next boot the
//! runtime observes `boot_state()` and either calls
//! `mark_app_valid_cancel_rollback` (healthy) or finds the loader already
//! reverted (`RolledBack`), which the uplink reports to the cloud.

pub mod file;
pub mod mock;

pub use file::FileOtaPlatform;
pub use mock::MockOtaPlatform;

use anyhow::Result;

/// What the loader decided at the last boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootState {
    /// Running an image that has already been marked valid.
    Normal,
    /// First boot of a freshly applied image; awaiting the health handshake.
    PendingVerify { version: String },
    /// The loader reverted to the previous image after a failed boot.
    RolledBack { version: String },
}

/// Platform primitive set used by the FOTA engine.
pub trait OtaPlatform: Send {
    /// Open the inactive bank for writing a new image of `size` bytes.
    ///
    /// When `resume` is set the bank contents are kept so already-written
    /// bytes can be re-read; otherwise the bank is truncated.
    fn begin(&mut self, size: u32, resume: bool) -> Result<()>;

    /// Append image bytes to the open bank.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read back already-written bytes (used to rebuild the streaming hash
    /// when resuming after a reset).
    fn read_back(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Close the writer.
    fn end(&mut self) -> Result<()>;

    /// Atomically point the loader at the bank that was just written.
    ///
    /// `version` is remembered so the next boot can report which image is
    /// pending verification.
    fn set_boot_target(&mut self, version: &str) -> Result<()>;

    /// Declare the running image healthy; cancels a pending rollback.
    fn mark_app_valid_cancel_rollback(&mut self) -> Result<()>;

    /// Ask for a device reset; the daemon observes `take_reset_request`.
    fn request_reset(&mut self);

    /// Consume a pending reset request.
    fn take_reset_request(&mut self) -> bool;

    /// Loader verdict for the current boot.
    fn boot_state(&self) -> BootState;
}
