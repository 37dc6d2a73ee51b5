// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Cloud-pushed configuration and command reconciliation
//!
//! The upload response may carry a `config_update` (sampling interval and/or
//! register selection) and a `command` (export-power write). Updates are
//! validated here into an accepted/rejected/unchanged verdict per key; an
//! accepted change is staged as the *next* configuration and promoted only
//! at the top of the following upload window, never mid-window. The verdict
//! is acknowledged one-shot in the next payload as `config_ack`.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::acquisition::FieldId;

/// Runtime acquisition configuration, the unit of promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Sampling period of the acquisition loop.
    pub sampling_interval_ms: u32,
    /// Fields to read each tick, deduplicated and sorted by register id.
    pub fields: Vec<FieldId>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            sampling_interval_ms: 5000,
            fields: FieldId::ALL.to_vec(),
        }
    }
}

impl RuntimeConfig {
    /// True when the field set covers the whole register map.
    pub fn reads_full_map(&self) -> bool {
        self.fields.len() == FieldId::ALL.len()
    }
}

/// Per-key verdicts of one `config_update`, reported one-shot to the cloud.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigAck {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ConfigAck {
    pub fn to_json(&self) -> Value {
        json!({
            "accepted": self.accepted,
            "rejected": self.rejected,
            "unchanged": self.unchanged,
        })
    }
}

/// Map cloud-side register names to field ids.
///
/// Returns `None` when any name is unknown or the list resolves empty; the
/// whole key is then rejected and the current set stays untouched. The
/// result is deduplicated and sorted by register id.
pub fn map_field_names(names: &[String]) -> Option<Vec<FieldId>> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        out.push(FieldId::parse(name)?);
    }
    if out.is_empty() {
        return None;
    }
    out.sort();
    out.dedup();
    Some(out)
}

/// Validate a `config_update` fragment against the current configuration.
///
/// Returns the staged next configuration (when at least one key was
/// accepted) and the acknowledgement.
pub fn reconcile(update: &Value, current: &RuntimeConfig) -> (Option<RuntimeConfig>, ConfigAck) {
    let mut ack = ConfigAck::default();
    let mut next = current.clone();
    let mut changed = false;

    match update.get("sampling_interval") {
        None => ack.unchanged.push("sampling_interval".to_string()),
        Some(v) => match v.as_u64() {
            Some(secs) if secs > 0 => {
                let ms = (secs as u32).saturating_mul(1000);
                if ms == current.sampling_interval_ms {
                    ack.unchanged.push("sampling_interval".to_string());
                } else {
                    next.sampling_interval_ms = ms;
                    changed = true;
                    ack.accepted.push("sampling_interval".to_string());
                }
            }
            _ => ack.rejected.push("sampling_interval".to_string()),
        },
    }

    match update.get("registers") {
        None => ack.unchanged.push("registers".to_string()),
        Some(v) => {
            let names: Option<Vec<String>> = v.as_array().map(|a| {
                a.iter()
                    .map(|n| n.as_str().unwrap_or_default().to_string())
                    .collect()
            });
            match names.as_deref().and_then(|n| map_field_names(n)) {
                None => ack.rejected.push("registers".to_string()),
                Some(fields) => {
                    let mut cur_sorted = current.fields.clone();
                    cur_sorted.sort();
                    if fields == cur_sorted {
                        ack.unchanged.push("registers".to_string());
                    } else {
                        next.fields = fields;
                        changed = true;
                        ack.accepted.push("registers".to_string());
                    }
                }
            }
        }
    }

    (changed.then_some(next), ack)
}

/// Single-slot staging area for a cloud-pushed register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommand {
    /// Requested export-power percentage, clamped to [0, 100] on execution.
    pub export_pct: i64,
    pub received_at_ms: u64,
}

/// Parse a `command` fragment; only `write_register` is understood.
pub fn parse_command(command: &Value, now_epoch_ms: u64) -> Option<PendingCommand> {
    if command.get("action")?.as_str()? != "write_register" {
        return None;
    }
    Some(PendingCommand {
        export_pct: command.get("value")?.as_i64()?,
        received_at_ms: now_epoch_ms,
    })
}

/// Outcome of an executed command, reported one-shot as `command_result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub executed_at_ms: u64,
    pub value: i64,
}

impl CommandResult {
    pub fn to_json(&self) -> Value {
        json!({
            "status": if self.success { "success" } else { "failure" },
            "executed_at": self.executed_at_ms,
            "value": self.value,
        })
    }
}

struct PlaneInner {
    current: RuntimeConfig,
    next: Option<RuntimeConfig>,
}

/// Shared current/next configuration pair.
///
/// The uplink task stages `next` while processing a reply and promotes it at
/// the top of its following cycle; the acquisition task only ever reads
/// `current`, so a staged change never takes effect mid-window.
pub struct ControlPlane {
    inner: RwLock<PlaneInner>,
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl ControlPlane {
    pub fn new(current: RuntimeConfig) -> Self {
        ControlPlane {
            inner: RwLock::new(PlaneInner {
                current,
                next: None,
            }),
        }
    }

    /// Snapshot of the active configuration.
    pub fn current(&self) -> RuntimeConfig {
        self.inner.read().unwrap().current.clone()
    }

    /// Stage a configuration for the next window boundary.
    pub fn stage(&self, next: RuntimeConfig) {
        self.inner.write().unwrap().next = Some(next);
    }

    /// Promote `next` to `current` if staged; returns the promoted value.
    pub fn promote(&self) -> Option<RuntimeConfig> {
        let mut inner = self.inner.write().unwrap();
        let next = inner.next.take()?;
        inner.current = next.clone();
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_keys_are_unchanged() {
        let current = RuntimeConfig::default();
        let (next, ack) = reconcile(&json!({}), &current);
        assert!(next.is_none());
        assert_eq!(ack.unchanged, vec!["sampling_interval", "registers"]);
        assert!(ack.accepted.is_empty());
        assert!(ack.rejected.is_empty());
    }

    #[test]
    fn new_interval_is_accepted_in_seconds() {
        let current = RuntimeConfig::default();
        let (next, ack) = reconcile(&json!({"sampling_interval": 2}), &current);
        assert_eq!(next.unwrap().sampling_interval_ms, 2000);
        assert_eq!(ack.accepted, vec!["sampling_interval"]);
    }

    #[test]
    fn equal_interval_is_unchanged() {
        let current = RuntimeConfig {
            sampling_interval_ms: 2000,
            ..Default::default()
        };
        let (next, ack) = reconcile(&json!({"sampling_interval": 2}), &current);
        assert!(next.is_none());
        assert!(ack.unchanged.contains(&"sampling_interval".to_string()));
    }

    #[test]
    fn invalid_interval_is_rejected() {
        let current = RuntimeConfig::default();
        let (next, ack) = reconcile(&json!({"sampling_interval": 0}), &current);
        assert!(next.is_none());
        assert_eq!(ack.rejected, vec!["sampling_interval"]);
    }

    #[test]
    fn unknown_register_rejects_whole_key() {
        let current = RuntimeConfig::default();
        let (next, ack) = reconcile(
            &json!({"registers": ["voltage", "bogus", "pac"]}),
            &current,
        );
        assert!(next.is_none());
        assert_eq!(ack.rejected, vec!["registers"]);
    }

    #[test]
    fn register_selection_is_deduplicated_and_sorted() {
        let current = RuntimeConfig::default();
        let (next, ack) = reconcile(
            &json!({"registers": ["pac", "voltage", "Power", "temp"]}),
            &current,
        );
        let next = next.unwrap();
        assert_eq!(
            next.fields,
            vec![FieldId::Vac1, FieldId::Temp, FieldId::Pac]
        );
        assert_eq!(ack.accepted, vec!["registers"]);
    }

    #[test]
    fn identical_register_set_is_unchanged_order_insensitive() {
        let current = RuntimeConfig {
            sampling_interval_ms: 5000,
            fields: vec![FieldId::Vac1, FieldId::Pac],
        };
        let (next, ack) = reconcile(&json!({"registers": ["pac", "voltage"]}), &current);
        assert!(next.is_none());
        assert!(ack.unchanged.contains(&"registers".to_string()));
    }

    #[test]
    fn promotion_happens_only_once() {
        let plane = ControlPlane::default();
        let staged = RuntimeConfig {
            sampling_interval_ms: 1000,
            fields: vec![FieldId::Pac],
        };
        plane.stage(staged.clone());
        assert_eq!(plane.promote(), Some(staged.clone()));
        assert_eq!(plane.current(), staged);
        assert_eq!(plane.promote(), None);
    }

    #[test]
    fn command_parsing_requires_write_register_action() {
        assert_eq!(
            parse_command(&json!({"action": "write_register", "value": 42}), 9),
            Some(PendingCommand {
                export_pct: 42,
                received_at_ms: 9
            })
        );
        assert_eq!(parse_command(&json!({"action": "reboot"}), 9), None);
        assert_eq!(parse_command(&json!({"value": 42}), 9), None);
    }

    #[test]
    fn command_result_serializes_status() {
        let r = CommandResult {
            success: true,
            executed_at_ms: 123,
            value: 10,
        };
        assert_eq!(
            r.to_json(),
            json!({"status": "success", "executed_at": 123, "value": 10})
        );
    }
}
