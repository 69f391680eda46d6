//! Persisted key-value preference store.
//!
//! Holds the tier cache, usage counter buckets and gated preferences. Keys are
//! namespaced strings (`usage.notifications.2026-03-01`), values are scalars.
//!
//! Two implementations are provided:
//! - [`FilePreferenceStore`]: append-only checksummed log, exclusive file lock
//! - [`MemoryPreferenceStore`]: process-local map for tests and ephemeral use

mod file;
mod memory;

pub use file::{FilePreferenceStore, FileStoreConfig};
pub use memory::MemoryPreferenceStore;

use crate::error::{GateError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A persisted scalar value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrefValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Date(NaiveDate),
}

impl PrefValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PrefValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PrefValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PrefValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Key-value store consumed for tier cache, counters and preferences.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<PrefValue>>;

    fn set(&self, key: &str, value: PrefValue) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, in unspecified order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Force buffered writes to durable storage.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Write `value`, retrying once before reporting a persistence failure.
pub fn set_with_retry(store: &dyn PreferenceStore, key: &str, value: PrefValue) -> Result<()> {
    match store.set(key, value.clone()) {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!(key, error = %first, "preference write failed, retrying once");
            store
                .set(key, value)
                .map_err(|e| GateError::PersistenceWriteFailure {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
        }
    }
}

/// Remove `key`, retrying once before reporting a persistence failure.
pub fn remove_with_retry(store: &dyn PreferenceStore, key: &str) -> Result<()> {
    match store.remove(key) {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!(key, error = %first, "preference removal failed, retrying once");
            store
                .remove(key)
                .map_err(|e| GateError::PersistenceWriteFailure {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
        }
    }
}
