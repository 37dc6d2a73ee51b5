// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Fault log and diagnostic counters
//!
//! A small bounded event list plus counters, drained into the `events` and
//! `diag` sidebands of the next upload. The device never surfaces errors
//! interactively; this is its only user-visible error channel.

use std::sync::Mutex;

use serde_json::{json, Value};

/// Upper bound on buffered event strings between two uploads.
const MAX_EVENTS: usize = 16;

/// A fault observed on the inverter link, reported one-shot to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// No reply from the simulator within the transport timeout budget.
    Timeout,
    /// Reply present but not a parseable Modbus frame (bad CRC, bad header).
    MalformedResponse,
    /// A well-formed Modbus exception frame with its code.
    Exception(u8),
}

impl SimFault {
    /// Sideband JSON shape.
    pub fn to_json(self) -> Value {
        match self {
            SimFault::Timeout => json!({"type": "timeout"}),
            SimFault::MalformedResponse => json!({"type": "malformed_response"}),
            SimFault::Exception(code) => json!({"type": "exception", "code": code}),
        }
    }
}

#[derive(Default)]
struct DiagInner {
    events: Vec<String>,
    overflow_recorded: bool,
    acq_failures: u64,
    consecutive_read_failures: u32,
    transport_failures: u64,
    sim_fault: Option<SimFault>,
}

/// Shared diagnostics state, updated by both tasks.
#[derive(Default)]
pub struct Diagnostics {
    inner: Mutex<DiagInner>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event string; silently dropped when the list is full.
    pub fn record_event(&self, event: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.events.len() < MAX_EVENTS {
            inner.events.push(event.to_string());
        }
    }

    /// Record a ring overflow; only the first occurrence per upload window
    /// produces an event, the dropped counter carries the magnitude.
    pub fn record_overflow(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.overflow_recorded {
            inner.overflow_recorded = true;
            if inner.events.len() < MAX_EVENTS {
                inner.events.push("buffer_overflow".to_string());
            }
        }
    }

    /// Count a failed group read; every third consecutive failure emits an
    /// `acq_read_fail` event.
    pub fn record_read_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.acq_failures += 1;
        inner.consecutive_read_failures += 1;
        if inner.consecutive_read_failures % 3 == 0 && inner.events.len() < MAX_EVENTS {
            inner.events.push("acq_read_fail".to_string());
        }
    }

    /// Reset the consecutive-failure streak after a successful group read.
    pub fn record_read_success(&self) {
        self.inner.lock().unwrap().consecutive_read_failures = 0;
    }

    /// Count an upload cycle that failed after all transport retries.
    pub fn record_transport_failure(&self) {
        self.inner.lock().unwrap().transport_failures += 1;
    }

    /// Stage a SIM-side fault for the next upload; the latest fault wins.
    pub fn set_sim_fault(&self, fault: SimFault) {
        self.inner.lock().unwrap().sim_fault = Some(fault);
    }

    /// Take the staged fault, if any (one-shot).
    pub fn take_sim_fault(&self) -> Option<SimFault> {
        self.inner.lock().unwrap().sim_fault.take()
    }

    /// Drain buffered events and re-arm the overflow first-occurrence latch.
    pub fn drain_events(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.overflow_recorded = false;
        std::mem::take(&mut inner.events)
    }

    /// Counter snapshot for the `diag` sideband.
    pub fn snapshot(&self, dropped_samples: u64, connection_failures: u64) -> Value {
        let inner = self.inner.lock().unwrap();
        json!({
            "dropped_samples": dropped_samples,
            "acq_failures": inner.acq_failures,
            "transport_failures": inner.transport_failures,
            "connection_failures": connection_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_third_consecutive_failure_logs_an_event() {
        let diag = Diagnostics::new();
        for _ in 0..2 {
            diag.record_read_failure();
        }
        assert!(diag.drain_events().is_empty());

        diag.record_read_failure(); // third in a row
        assert_eq!(diag.drain_events(), vec!["acq_read_fail"]);

        // a success resets the streak
        diag.record_read_success();
        diag.record_read_failure();
        diag.record_read_failure();
        assert!(diag.drain_events().is_empty());
    }

    #[test]
    fn overflow_event_is_first_occurrence_only() {
        let diag = Diagnostics::new();
        diag.record_overflow();
        diag.record_overflow();
        assert_eq!(diag.drain_events(), vec!["buffer_overflow"]);
        // re-armed after the drain
        diag.record_overflow();
        assert_eq!(diag.drain_events(), vec!["buffer_overflow"]);
    }

    #[test]
    fn sim_fault_is_one_shot_latest_wins() {
        let diag = Diagnostics::new();
        diag.set_sim_fault(SimFault::Timeout);
        diag.set_sim_fault(SimFault::Exception(0x02));
        assert_eq!(diag.take_sim_fault(), Some(SimFault::Exception(0x02)));
        assert_eq!(diag.take_sim_fault(), None);
    }

    #[test]
    fn event_list_is_bounded() {
        let diag = Diagnostics::new();
        for i in 0..40 {
            diag.record_event(&format!("e{i}"));
        }
        assert_eq!(diag.drain_events().len(), MAX_EVENTS);
    }

    #[test]
    fn snapshot_reports_counters() {
        let diag = Diagnostics::new();
        diag.record_read_failure();
        diag.record_transport_failure();
        let snap = diag.snapshot(7, 3);
        assert_eq!(snap["dropped_samples"], 7);
        assert_eq!(snap["acq_failures"], 1);
        assert_eq!(snap["transport_failures"], 1);
        assert_eq!(snap["connection_failures"], 3);
    }
}
