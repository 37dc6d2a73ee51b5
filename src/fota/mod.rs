// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Firmware-over-the-air engine
//!
//! Firmware arrives as base64 chunks piggybacked on upload replies (or
//! fetched over GET), strictly in order. The engine streams them into the
//! inactive bank while maintaining a rolling SHA-256, persists its cursor
//! after every chunk so a reset resumes instead of restarting, verifies the
//! digest against the manifest before touching the boot configuration, and
//! completes the pending-verify/rollback handshake on the boot that follows
//! a switch.
//!
//! State machine: `Idle -> Downloading -> VerifyOk -> BootOk` on the happy
//! path; `Downloading -> VerifyFailed -> Idle` on corruption;
//! `BootOk -> BootRollback -> Idle` when the new image fails its boot
//! self-test and the loader reverts.

pub mod platform;

pub use platform::{BootState, FileOtaPlatform, MockOtaPlatform, OtaPlatform};

use std::sync::Arc;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use base64::prelude::*;

use crate::store::KvStore;

const NS: &str = "fota";
const K_VER: &str = "mf.ver";
const K_SZ: &str = "mf.size";
const K_HASH: &str = "mf.hash";
const K_WR: &str = "bytes_written";
const K_NEXT: &str = "next_chunk";

/// Buffer size for re-hashing already-written bytes on resume.
const RESUME_READ_CHUNK: usize = 1024;

fn default_chunk_size() -> u32 {
    1024
}

/// Update manifest pushed by the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub size: u32,
    pub hash_hex: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
}

impl Manifest {
    /// Session identity: two manifests with equal version, hash and size
    /// describe the same image.
    fn same_identity(&self, other: &Manifest) -> bool {
        self.version == other.version
            && self.hash_hex == other.hash_hex
            && self.size == other.size
    }
}

/// Engine lifecycle states reported to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FotaStatus {
    Idle,
    Downloading,
    VerifyOk,
    VerifyFailed,
    BootOk,
    BootRollback,
}

/// Failure taxonomy; the wire code of each variant lands in `fota.error`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FotaError {
    #[error("no update bank available")]
    NoUpdatePartition,
    #[error("failed to open update bank")]
    OtaBegin,
    #[error("failed to reopen update bank for resume")]
    OtaBeginResume,
    #[error("failed to re-read written bytes on resume")]
    ResumeRead,
    #[error("chunk is not valid base64")]
    BadB64,
    #[error("chunk would exceed the manifest size")]
    Overflow,
    #[error("chunk number out of order")]
    OutOfOrder,
    #[error("failed to write chunk to bank")]
    OtaWrite,
    #[error("manifest hash is not 64 hex chars")]
    BadHashFormat,
    #[error("failed to close update bank")]
    OtaEnd,
    #[error("failed to switch boot bank")]
    SetBoot,
}

impl FotaError {
    /// Short code reported in the `fota.error` sideband.
    pub fn code(self) -> &'static str {
        match self {
            FotaError::NoUpdatePartition => "no-update-partition",
            FotaError::OtaBegin => "ota-begin",
            FotaError::OtaBeginResume => "ota-begin-resume",
            FotaError::ResumeRead => "resume-read",
            FotaError::BadB64 => "bad-b64",
            FotaError::Overflow => "overflow",
            FotaError::OutOfOrder => "out-of-order",
            FotaError::OtaWrite => "ota-write",
            FotaError::BadHashFormat => "bad-hash-format",
            FotaError::OtaEnd => "ota-end",
            FotaError::SetBoot => "set-boot",
        }
    }
}

/// One-shot outcome of the post-switch boot handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootReport {
    /// New image booted and was marked valid.
    BootOk,
    /// Loader reverted to the previous image.
    RolledBack { version: String },
}

/// Status snapshot for logging and the progress sideband.
#[derive(Debug, Clone, Serialize)]
pub struct FotaStatusReport {
    pub active: bool,
    pub version: String,
    pub written: u32,
    pub total: u32,
    pub next_chunk: u32,
    pub finalize_requested: bool,
    pub finalized: bool,
    pub error: String,
}

struct Session {
    manifest: Manifest,
    sha: Sha256,
    bytes_written: u32,
    next_chunk: u32,
    finalize_requested: bool,
}

/// Progress callback `(written, total)`.
pub type ProgressHook = Box<dyn Fn(u32, u32) + Send>;

/// Chunked firmware ingestion over a dual-bank platform.
pub struct FotaEngine {
    platform: Box<dyn OtaPlatform>,
    store: Arc<KvStore>,
    session: Option<Session>,
    status: FotaStatus,
    last_error: Option<FotaError>,
    error_staged: Option<FotaError>,
    boot_report: Option<BootReport>,
    progress_hook: Option<ProgressHook>,
}

impl FotaEngine {
    pub fn new(platform: Box<dyn OtaPlatform>, store: Arc<KvStore>) -> Self {
        FotaEngine {
            platform,
            store,
            session: None,
            status: FotaStatus::Idle,
            last_error: None,
            error_staged: None,
            boot_report: None,
            progress_hook: None,
        }
    }

    /// Register a `(written, total)` progress callback.
    pub fn set_progress_hook(&mut self, hook: ProgressHook) {
        self.progress_hook = Some(hook);
    }

    /// Whether a download session is in flight.
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Engine state.
    pub fn status(&self) -> FotaStatus {
        self.status
    }

    /// The only chunk number the device will accept next; 0 when idle. The
    /// server must treat this as authoritative.
    pub fn next_chunk_for_cloud(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.next_chunk)
    }

    /// One-shot error code for the `fota.error` sideband.
    pub fn take_staged_error(&mut self) -> Option<FotaError> {
        self.error_staged.take()
    }

    /// One-shot boot handshake outcome for the next upload.
    pub fn take_boot_report(&mut self) -> Option<BootReport> {
        self.boot_report.take()
    }

    /// Consume a reset request raised by a successful apply.
    pub fn take_reset_request(&mut self) -> bool {
        self.platform.take_reset_request()
    }

    /// Snapshot for logging and the progress sideband.
    pub fn status_report(&self) -> FotaStatusReport {
        let (version, written, total, next_chunk, finalize_requested) = match &self.session {
            Some(s) => (
                s.manifest.version.clone(),
                s.bytes_written,
                s.manifest.size,
                s.next_chunk,
                s.finalize_requested,
            ),
            None => (String::new(), 0, 0, 0, false),
        };
        FotaStatusReport {
            active: self.session.is_some(),
            version,
            written,
            total,
            next_chunk,
            finalize_requested,
            finalized: matches!(self.status, FotaStatus::VerifyOk | FotaStatus::VerifyFailed),
            error: self.last_error.map(FotaError::code).unwrap_or("").to_string(),
        }
    }

    fn fail(&mut self, err: FotaError) -> FotaError {
        self.last_error = Some(err);
        self.error_staged = Some(err);
        err
    }

    fn clear_progress_keys(&self) {
        let _ = self.store.set_u64(NS, K_WR, 0);
        let _ = self.store.set_u64(NS, K_NEXT, 0);
    }

    fn abort_session(&mut self) {
        if self.session.take().is_some() {
            let _ = self.platform.end();
        }
        self.clear_progress_keys();
        self.status = FotaStatus::Idle;
    }

    /// Run the boot-side half of the handshake.
    ///
    /// On the first boot after a bank switch the platform reports
    /// pending-verify; marking the app valid cancels the rollback and stages
    /// a one-shot `boot_ok`. If the loader already reverted, a `boot_failed`
    /// report is staged instead.
    pub fn on_boot(&mut self) {
        match self.platform.boot_state() {
            BootState::PendingVerify { version } => {
                match self.platform.mark_app_valid_cancel_rollback() {
                    Ok(()) => {
                        info!("boot of version {version} healthy, rollback cancelled");
                        self.status = FotaStatus::BootOk;
                        self.boot_report = Some(BootReport::BootOk);
                    }
                    Err(e) => error!("failed to mark app valid: {e}"),
                }
            }
            BootState::RolledBack { version } => {
                warn!("loader rolled back version {version}");
                self.status = FotaStatus::BootRollback;
                self.boot_report = Some(BootReport::RolledBack { version });
                self.clear_progress_keys();
            }
            BootState::Normal => {}
        }
    }

    /// Begin (or resume) a session for `manifest`.
    ///
    /// A duplicate manifest while a session is active is a no-op so server
    /// retransmissions cannot reset the cursor. A different manifest aborts
    /// the previous session cleanly. When persisted progress matches the
    /// manifest identity and is incomplete, the session resumes: the rolling
    /// SHA-256 is rebuilt by re-reading the written bytes in small passes.
    pub fn start(&mut self, manifest: Manifest) -> Result<(), FotaError> {
        if let Some(session) = &self.session {
            if session.manifest.same_identity(&manifest) {
                info!(
                    "duplicate manifest for {} ignored (next_chunk={} written={})",
                    manifest.version, session.next_chunk, session.bytes_written
                );
                return Ok(());
            }
            warn!(
                "manifest {} supersedes active session {}",
                manifest.version, session.manifest.version
            );
            self.abort_session();
        }

        let stored_version = self.store.get_str(NS, K_VER).unwrap_or_default();
        let stored_hash = self.store.get_str(NS, K_HASH).unwrap_or_default();
        let stored_size = self.store.get_u64(NS, K_SZ).unwrap_or(0) as u32;
        let mut written = self.store.get_u64(NS, K_WR).unwrap_or(0) as u32;
        let mut next = self.store.get_u64(NS, K_NEXT).unwrap_or(0) as u32;

        let mut can_resume = stored_version == manifest.version
            && stored_hash == manifest.hash_hex
            && stored_size == manifest.size
            && written > 0
            && written < manifest.size;

        // sanity-clamp persisted progress
        if can_resume {
            written = written.min(manifest.size);
            let chunks_total = manifest.size.div_ceil(manifest.chunk_size.max(1));
            if next > chunks_total {
                can_resume = false;
            }
        }

        if can_resume {
            if self.platform.begin(manifest.size, true).is_err() {
                return Err(self.fail(FotaError::OtaBeginResume));
            }
            let mut sha = Sha256::new();
            let mut buf = [0u8; RESUME_READ_CHUNK];
            let mut off: u64 = 0;
            while off < u64::from(written) {
                let take = usize::min(RESUME_READ_CHUNK, (u64::from(written) - off) as usize);
                if self.platform.read_back(off, &mut buf[..take]).is_err() {
                    return Err(self.fail(FotaError::ResumeRead));
                }
                sha.update(&buf[..take]);
                off += take as u64;
            }
            warn!(
                "FOTA resume: version={} written={} next_chunk={} (SHA rebuilt)",
                manifest.version, written, next
            );
            self.session = Some(Session {
                manifest,
                sha,
                bytes_written: written,
                next_chunk: next,
                finalize_requested: false,
            });
        } else {
            if self.platform.begin(manifest.size, false).is_err() {
                return Err(self.fail(FotaError::OtaBegin));
            }
            next = 0;
            let _ = self.store.set_str(NS, K_VER, &manifest.version);
            let _ = self.store.set_str(NS, K_HASH, &manifest.hash_hex);
            let _ = self.store.set_u64(NS, K_SZ, u64::from(manifest.size));
            self.clear_progress_keys();
            info!(
                "FOTA start: version={} size={} chunk={}",
                manifest.version, manifest.size, manifest.chunk_size
            );
            self.session = Some(Session {
                manifest,
                sha: Sha256::new(),
                bytes_written: 0,
                next_chunk: next,
                finalize_requested: false,
            });
        }

        self.status = FotaStatus::Downloading;
        self.last_error = None;
        Ok(())
    }

    /// Ingest one base64 chunk.
    ///
    /// Only `next_chunk` is accepted; anything else fails with
    /// `out-of-order` and leaves the session untouched so the server can
    /// resend the right one. `overflow` and `ota-write` abort the session.
    pub fn ingest_chunk(&mut self, number: u32, data_b64: &str) -> Result<(), FotaError> {
        let (expected, written_so_far, total) = match &self.session {
            Some(s) => (s.next_chunk, s.bytes_written, s.manifest.size),
            None => {
                warn!("chunk #{number} ignored: no active session");
                return Ok(());
            }
        };

        if number != expected {
            warn!("reject chunk #{number} (expecting #{expected})");
            return Err(self.fail(FotaError::OutOfOrder));
        }

        let Ok(bin) = BASE64_STANDARD.decode(data_b64) else {
            error!("base64 decode failed at chunk #{number}");
            return Err(self.fail(FotaError::BadB64));
        };
        if bin.is_empty() {
            return Err(self.fail(FotaError::BadB64));
        }

        if written_so_far as usize + bin.len() > total as usize {
            error!(
                "chunk overflow: written={written_so_far} + {} > total={total}",
                bin.len()
            );
            self.abort_session();
            return Err(self.fail(FotaError::Overflow));
        }

        if self.platform.write(&bin).is_err() {
            self.abort_session();
            return Err(self.fail(FotaError::OtaWrite));
        }

        let (written, next) = match self.session.as_mut() {
            Some(session) => {
                session.sha.update(&bin);
                session.bytes_written += bin.len() as u32;
                session.next_chunk = number + 1;
                if session.bytes_written == total {
                    session.finalize_requested = true;
                }
                (session.bytes_written, session.next_chunk)
            }
            None => return Ok(()),
        };
        let _ = self.store.set_u64(NS, K_WR, u64::from(written));
        let _ = self.store.set_u64(NS, K_NEXT, u64::from(next));

        info!("FOTA chunk #{number} accepted, written={written}/{total}");
        if let Some(hook) = &self.progress_hook {
            hook(written, total);
        }
        Ok(())
    }

    /// Whether every byte of the image has been ingested.
    pub fn finalize_ready(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.finalize_requested && s.bytes_written == s.manifest.size)
    }

    /// Verify the streamed digest and, on success, switch boot and request a
    /// reset. Returns `(verify_ok, apply_ok)`.
    ///
    /// A digest mismatch clears the persisted progress and leaves the boot
    /// configuration untouched; the session ends in `VerifyFailed`.
    pub fn finalize_and_apply(&mut self) -> (bool, bool) {
        if !self.finalize_ready() {
            return (false, false);
        }
        let Some(session) = self.session.take() else {
            return (false, false);
        };
        let manifest = session.manifest;
        let calc = hex::encode(session.sha.finalize());

        if manifest.hash_hex.len() != 64
            || !manifest.hash_hex.bytes().all(|b| b.is_ascii_hexdigit())
        {
            error!("bad manifest hash format");
            self.fail(FotaError::BadHashFormat);
            let _ = self.platform.end();
            self.clear_progress_keys();
            self.status = FotaStatus::Idle;
            return (false, false);
        }

        let verify_ok = calc.eq_ignore_ascii_case(&manifest.hash_hex);

        if self.platform.end().is_err() {
            self.fail(FotaError::OtaEnd);
            self.clear_progress_keys();
            self.status = FotaStatus::Idle;
            return (false, false);
        }

        if !verify_ok {
            error!("SHA-256 mismatch, keeping current image (not switching boot)");
            self.status = FotaStatus::VerifyFailed;
            self.clear_progress_keys();
            return (false, false);
        }

        if self.platform.set_boot_target(&manifest.version).is_err() {
            self.fail(FotaError::SetBoot);
            self.clear_progress_keys();
            self.status = FotaStatus::Idle;
            return (true, false);
        }

        info!(
            "FOTA finalize success: version {} verified, boot switched, resetting",
            manifest.version
        );
        self.status = FotaStatus::VerifyOk;
        self.clear_progress_keys();
        self.platform.request_reset();
        (true, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_mock() -> FotaEngine {
        FotaEngine::new(
            Box::new(MockOtaPlatform::new()),
            Arc::new(KvStore::in_memory()),
        )
    }

    fn manifest_for(image: &[u8], chunk_size: u32) -> Manifest {
        Manifest {
            version: "2.0.0".to_string(),
            size: image.len() as u32,
            hash_hex: hex::encode(Sha256::digest(image)),
            chunk_size,
        }
    }

    fn chunk_b64(image: &[u8], chunk_size: usize, number: usize) -> String {
        let start = number * chunk_size;
        let end = usize::min(start + chunk_size, image.len());
        BASE64_STANDARD.encode(&image[start..end])
    }

    #[test]
    fn out_of_order_chunk_leaves_state_unchanged() {
        let image = vec![0xAB; 2048];
        let mut engine = engine_with_mock();
        engine.start(manifest_for(&image, 1024)).unwrap();
        engine.ingest_chunk(0, &chunk_b64(&image, 1024, 0)).unwrap();

        let err = engine.ingest_chunk(2, &chunk_b64(&image, 1024, 1));
        assert_eq!(err, Err(FotaError::OutOfOrder));
        let report = engine.status_report();
        assert_eq!(report.written, 1024);
        assert_eq!(report.next_chunk, 1);
    }

    #[test]
    fn duplicate_manifest_is_a_no_op() {
        let image = vec![0x11; 2048];
        let manifest = manifest_for(&image, 1024);
        let mut engine = engine_with_mock();
        engine.start(manifest.clone()).unwrap();
        engine.ingest_chunk(0, &chunk_b64(&image, 1024, 0)).unwrap();

        engine.start(manifest).unwrap();
        let report = engine.status_report();
        assert_eq!(report.written, 1024);
        assert_eq!(report.next_chunk, 1);
    }

    #[test]
    fn overflow_aborts_the_session() {
        let image = vec![0x22; 1024];
        let mut engine = engine_with_mock();
        engine.start(manifest_for(&image, 1024)).unwrap();

        let oversized = BASE64_STANDARD.encode(vec![0u8; 2048]);
        assert_eq!(engine.ingest_chunk(0, &oversized), Err(FotaError::Overflow));
        assert!(!engine.is_active());
        assert_eq!(engine.next_chunk_for_cloud(), 0);
    }

    #[test]
    fn bad_base64_is_reported() {
        let image = vec![0x33; 1024];
        let mut engine = engine_with_mock();
        engine.start(manifest_for(&image, 1024)).unwrap();
        assert_eq!(
            engine.ingest_chunk(0, "!!not-base64!!"),
            Err(FotaError::BadB64)
        );
        assert_eq!(engine.take_staged_error(), Some(FotaError::BadB64));
        assert_eq!(engine.take_staged_error(), None);
    }

    #[test]
    fn idle_chunk_is_ignored() {
        let mut engine = engine_with_mock();
        assert_eq!(engine.next_chunk_for_cloud(), 0);
        assert!(engine.ingest_chunk(0, "AAAA").is_ok());
        assert!(!engine.is_active());
    }
}
