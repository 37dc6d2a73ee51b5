// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! File-backed dual-bank platform
//!
//! Keeps `bank_a.bin` / `bank_b.bin` and a `boot.json` state file under one
//! directory. The inactive bank receives the incoming image; switching boot
//! flips the active bank and arms the pending-verify flag, which the next
//! boot must clear through `mark_app_valid_cancel_rollback`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::{BootState, OtaPlatform};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BootFile {
    active_bank: u8,
    pending_verify: bool,
    pending_version: String,
    rolled_back: bool,
    rolled_back_version: String,
}

impl Default for BootFile {
    fn default() -> Self {
        BootFile {
            active_bank: 0,
            pending_verify: false,
            pending_version: String::new(),
            rolled_back: false,
            rolled_back_version: String::new(),
        }
    }
}

/// Dual-bank store in a directory.
pub struct FileOtaPlatform {
    dir: PathBuf,
    boot: BootFile,
    writer: Option<File>,
    reset_requested: bool,
}

impl FileOtaPlatform {
    /// Open (or initialize) the bank directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create update directory {:?}", dir))?;
        let boot_path = dir.join("boot.json");
        let boot = if boot_path.exists() {
            let contents = fs::read_to_string(&boot_path)?;
            serde_json::from_str(&contents)
                .with_context(|| format!("corrupt boot state at {:?}", boot_path))?
        } else {
            BootFile::default()
        };
        Ok(FileOtaPlatform {
            dir,
            boot,
            writer: None,
            reset_requested: false,
        })
    }

    fn bank_path(&self, bank: u8) -> PathBuf {
        self.dir.join(if bank == 0 { "bank_a.bin" } else { "bank_b.bin" })
    }

    fn inactive_bank(&self) -> u8 {
        1 - self.boot.active_bank
    }

    fn save_boot(&self) -> Result<()> {
        let path = self.dir.join("boot.json");
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&self.boot)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl OtaPlatform for FileOtaPlatform {
    fn begin(&mut self, size: u32, resume: bool) -> Result<()> {
        let path = self.bank_path(self.inactive_bank());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(!resume)
            .open(&path)
            .with_context(|| format!("failed to open update bank {:?}", path))?;
        if resume {
            // appends continue where the previous session stopped
            let mut file = file;
            file.seek(SeekFrom::End(0))?;
            self.writer = Some(file);
        } else {
            self.writer = Some(file);
        }
        info!(
            "update bank {:?} open (size={} resume={})",
            path, size, resume
        );
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.write_all(data).context("bank write failed"),
            None => bail!("no open update bank"),
        }
    }

    fn read_back(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let path = self.bank_path(self.inactive_bank());
        let mut file = File::open(&path)
            .with_context(|| format!("failed to reopen bank {:?} for resume", path))?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf).context("bank read-back short")
    }

    fn end(&mut self) -> Result<()> {
        if let Some(mut w) = self.writer.take() {
            w.flush().context("bank flush failed")?;
        }
        Ok(())
    }

    fn set_boot_target(&mut self, version: &str) -> Result<()> {
        self.boot.active_bank = self.inactive_bank();
        self.boot.pending_verify = true;
        self.boot.pending_version = version.to_string();
        self.boot.rolled_back = false;
        self.boot.rolled_back_version.clear();
        self.save_boot()
    }

    fn mark_app_valid_cancel_rollback(&mut self) -> Result<()> {
        self.boot.pending_verify = false;
        self.boot.pending_version.clear();
        self.save_boot()
    }

    fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    fn take_reset_request(&mut self) -> bool {
        std::mem::take(&mut self.reset_requested)
    }

    fn boot_state(&self) -> BootState {
        if self.boot.rolled_back {
            return BootState::RolledBack {
                version: self.boot.rolled_back_version.clone(),
            };
        }
        if self.boot.pending_verify {
            return BootState::PendingVerify {
                version: self.boot.pending_version.clone(),
            };
        }
        BootState::Normal
    }
}

impl Drop for FileOtaPlatform {
    fn drop(&mut self) {
        if self.writer.is_some() {
            warn!("update bank writer dropped without end()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut platform = FileOtaPlatform::open(dir.path()).unwrap();
        platform.begin(8, false).unwrap();
        platform.write(b"firmware").unwrap();
        platform.end().unwrap();

        let mut buf = [0u8; 8];
        platform.read_back(0, &mut buf).unwrap();
        assert_eq!(&buf, b"firmware");
    }

    #[test]
    fn boot_switch_arms_pending_verify_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut platform = FileOtaPlatform::open(dir.path()).unwrap();
            platform.begin(4, false).unwrap();
            platform.write(b"newi").unwrap();
            platform.end().unwrap();
            platform.set_boot_target("2.0.0").unwrap();
            assert!(matches!(
                platform.boot_state(),
                BootState::PendingVerify { ref version } if version == "2.0.0"
            ));
        }
        // "reboot": reopen from disk
        let mut platform = FileOtaPlatform::open(dir.path()).unwrap();
        assert!(matches!(
            platform.boot_state(),
            BootState::PendingVerify { ref version } if version == "2.0.0"
        ));
        platform.mark_app_valid_cancel_rollback().unwrap();
        assert_eq!(platform.boot_state(), BootState::Normal);
    }

    #[test]
    fn resume_keeps_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut platform = FileOtaPlatform::open(dir.path()).unwrap();
        platform.begin(8, false).unwrap();
        platform.write(b"half").unwrap();
        platform.end().unwrap();

        platform.begin(8, true).unwrap();
        platform.write(b"done").unwrap();
        platform.end().unwrap();

        let mut buf = [0u8; 8];
        platform.read_back(0, &mut buf).unwrap();
        assert_eq!(&buf, b"halfdone");
    }
}
