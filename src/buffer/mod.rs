// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Fixed-capacity sample buffer bridging the acquisition and uplink tasks
//!
//! The ring holds timestamped records and overwrites the oldest entry on
//! overflow: dropping old samples is preferred to stalling acquisition. A
//! lifetime dropped counter feeds the `diag` sideband of the next upload.
//!
//! All operations serialize on one mutex held only for the in-memory body;
//! no I/O ever happens under the lock. `snapshot_and_clear` is atomic with
//! respect to `push`: the returned records and the cleared state reflect the
//! same instant.

use std::sync::Mutex;

use crate::acquisition::Sample;

/// One timestamped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// Wall-clock time the reading completed, in milliseconds.
    pub epoch_ms: u64,
    /// Raw register values.
    pub sample: Sample,
}

struct RingInner {
    recs: Vec<Record>,
    read: usize,
    write: usize,
    count: usize,
    dropped: u64,
}

/// Thread-safe overwrite-oldest record store.
pub struct Ring {
    cap: usize,
    inner: Mutex<RingInner>,
}

impl Ring {
    /// Create a ring holding up to `capacity` records.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Ring {
            cap: capacity,
            inner: Mutex::new(RingInner {
                recs: vec![
                    Record {
                        epoch_ms: 0,
                        sample: Sample::default()
                    };
                    capacity
                ],
                read: 0,
                write: 0,
                count: 0,
                dropped: 0,
            }),
        }
    }

    /// Append a record, overwriting the oldest when full.
    ///
    /// Returns `true` exactly when an old record was overwritten; the
    /// lifetime dropped counter advances by one in that case.
    pub fn push(&self, rec: Record) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let write = inner.write;
        inner.recs[write] = rec;
        inner.write = (inner.write + 1) % self.cap;
        if inner.count < self.cap {
            inner.count += 1;
            false
        } else {
            inner.read = (inner.read + 1) % self.cap;
            inner.dropped += 1;
            true
        }
    }

    /// Atomically take all live records in chronological order and reset the
    /// ring to empty.
    pub fn snapshot_and_clear(&self) -> Vec<Record> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(inner.count);
        for i in 0..inner.count {
            out.push(inner.recs[(inner.read + i) % self.cap]);
        }
        inner.read = 0;
        inner.write = 0;
        inner.count = 0;
        out
    }

    /// Put a previously snapshotted batch back in front of whatever has been
    /// pushed since.
    ///
    /// Used when an upload fails after the window was drained: the batch is
    /// older than any record produced during the attempt, so it re-enters
    /// ahead of the current contents. Overwrite-oldest still governs: if the
    /// combined set exceeds capacity, the oldest records are discarded and
    /// counted as dropped.
    pub fn restore_front(&self, batch: Vec<Record>) {
        if batch.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let mut combined = batch;
        for i in 0..inner.count {
            let rec = inner.recs[(inner.read + i) % self.cap];
            combined.push(rec);
        }
        let overflow = combined.len().saturating_sub(self.cap);
        inner.dropped += overflow as u64;
        let keep = combined.split_off(overflow);
        for (i, rec) in keep.iter().enumerate() {
            inner.recs[i] = *rec;
        }
        inner.read = 0;
        inner.count = keep.len();
        inner.write = keep.len() % self.cap;
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    /// True when no records are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Read and reset the lifetime dropped counter.
    pub fn get_and_clear_dropped(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.dropped)
    }
}
