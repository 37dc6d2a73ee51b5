// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Persistent key-value store for state that must survive a reset
//!
//! Namespaced `(ns, key)` pairs holding small integers or short strings:
//! envelope nonces (`sec/`), the FOTA resume cursor and manifest identity
//! (`fota/`), and the staged runtime configuration (`cfg/`). Every mutation
//! is written through to disk before it returns, via a temp-file rename so a
//! power cut never leaves a torn snapshot. Missing keys are `None`, not an
//! error.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A stored value: the contract only needs integers and short strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum KvValue {
    U64(u64),
    Str(String),
}

struct StoreInner {
    map: BTreeMap<String, KvValue>,
    path: Option<PathBuf>,
}

/// Namespaced write-through key-value store.
pub struct KvStore {
    inner: Mutex<StoreInner>,
}

fn compose(ns: &str, key: &str) -> String {
    format!("{ns}/{key}")
}

impl KvStore {
    /// Open a store backed by `path`, loading the existing snapshot when the
    /// file is present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read store at {:?}", path))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("corrupt store snapshot at {:?}", path))?
        } else {
            BTreeMap::new()
        };
        Ok(KvStore {
            inner: Mutex::new(StoreInner {
                map,
                path: Some(path),
            }),
        })
    }

    /// Volatile store for tests; nothing is written to disk.
    pub fn in_memory() -> Self {
        KvStore {
            inner: Mutex::new(StoreInner {
                map: BTreeMap::new(),
                path: None,
            }),
        }
    }

    fn flush(inner: &StoreInner) -> Result<()> {
        let Some(path) = &inner.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create store directory {:?}", parent))?;
            }
        }
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(&inner.map)?;
        fs::write(&tmp, json).with_context(|| format!("failed to write {:?}", tmp))?;
        fs::rename(&tmp, path).with_context(|| format!("failed to replace {:?}", path))?;
        Ok(())
    }

    /// Read an integer value.
    pub fn get_u64(&self, ns: &str, key: &str) -> Option<u64> {
        match self.inner.lock().unwrap().map.get(&compose(ns, key)) {
            Some(KvValue::U64(v)) => Some(*v),
            _ => None,
        }
    }

    /// Write an integer value through to disk.
    pub fn set_u64(&self, ns: &str, key: &str, value: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.map.insert(compose(ns, key), KvValue::U64(value));
        Self::flush(&inner)
    }

    /// Read a string value.
    pub fn get_str(&self, ns: &str, key: &str) -> Option<String> {
        match self.inner.lock().unwrap().map.get(&compose(ns, key)) {
            Some(KvValue::Str(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Write a string value through to disk.
    pub fn set_str(&self, ns: &str, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .map
            .insert(compose(ns, key), KvValue::Str(value.to_string()));
        Self::flush(&inner)
    }

    /// Remove a key; absent keys are a no-op.
    pub fn remove(&self, ns: &str, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.remove(&compose(ns, key)).is_some() {
            Self::flush(&inner)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_are_none() {
        let store = KvStore::in_memory();
        assert_eq!(store.get_u64("sec", "nonce_device"), None);
        assert_eq!(store.get_str("fota", "mf.ver"), None);
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = KvStore::open(&path).unwrap();
            store.set_u64("sec", "nonce_device", 42).unwrap();
            store.set_str("fota", "mf.ver", "1.2.3").unwrap();
        }
        let store = KvStore::open(&path).unwrap();
        assert_eq!(store.get_u64("sec", "nonce_device"), Some(42));
        assert_eq!(store.get_str("fota", "mf.ver"), Some("1.2.3".to_string()));
    }

    #[test]
    fn namespaces_do_not_collide() {
        let store = KvStore::in_memory();
        store.set_u64("sec", "n", 1).unwrap();
        store.set_u64("fota", "n", 2).unwrap();
        assert_eq!(store.get_u64("sec", "n"), Some(1));
        assert_eq!(store.get_u64("fota", "n"), Some(2));
    }

    #[test]
    fn type_mismatch_reads_as_missing() {
        let store = KvStore::in_memory();
        store.set_str("cfg", "runtime", "x").unwrap();
        assert_eq!(store.get_u64("cfg", "runtime"), None);
    }

    #[test]
    fn remove_is_idempotent() {
        let store = KvStore::in_memory();
        store.set_u64("sec", "n", 1).unwrap();
        store.remove("sec", "n").unwrap();
        store.remove("sec", "n").unwrap();
        assert_eq!(store.get_u64("sec", "n"), None);
    }
}
