// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Gateway time base
//!
//! Record timestamps are `monotonic_ms + epoch_offset_ms`. The offset is
//! zero until the first successful sync against an external epoch source, so
//! early timestamps are monotonic-only; once synced they are wall clock.
//! Within one upload window timestamps are always non-decreasing either way.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic clock with a late-bound epoch offset.
pub struct GatewayClock {
    start: Instant,
    epoch_offset_ms: AtomicU64,
    synced: AtomicBool,
}

impl Default for GatewayClock {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayClock {
    pub fn new() -> Self {
        GatewayClock {
            start: Instant::now(),
            epoch_offset_ms: AtomicU64::new(0),
            synced: AtomicBool::new(false),
        }
    }

    /// Milliseconds since process start.
    pub fn monotonic_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Current epoch milliseconds (monotonic-only before the first sync).
    pub fn now_epoch_ms(&self) -> u64 {
        self.monotonic_ms() + self.epoch_offset_ms.load(Ordering::Acquire)
    }

    /// Whether an epoch sync has happened.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Set the epoch offset from the system clock.
    ///
    /// The host build uses the OS clock as the external epoch source; the
    /// NTP exchange itself is outside the core. Returns `false` when the
    /// system clock is before the epoch.
    pub fn sync_from_system(&self) -> bool {
        let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) else {
            return false;
        };
        let offset = (now.as_millis() as u64).saturating_sub(self.monotonic_ms());
        self.epoch_offset_ms.store(offset, Ordering::Release);
        self.synced.store(true, Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsynced_clock_is_monotonic_only() {
        let clock = GatewayClock::new();
        assert!(!clock.is_synced());
        let a = clock.now_epoch_ms();
        let b = clock.now_epoch_ms();
        assert!(b >= a);
        // without an offset the epoch reading equals the monotonic one
        assert!(clock.now_epoch_ms() < 60_000);
    }

    #[test]
    fn sync_moves_timestamps_to_wall_clock() {
        let clock = GatewayClock::new();
        assert!(clock.sync_from_system());
        assert!(clock.is_synced());
        // sometime after 2023-01-01
        assert!(clock.now_epoch_ms() > 1_672_531_200_000);
    }
}
