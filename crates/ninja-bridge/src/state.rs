//! Last-known device state
//!
//! Written by both ingest paths and read by the scheduler and the debug
//! topic. Keys are device ids rendered as text.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-wide map of device id to last observed or commanded value.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl StateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the value of a device
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().insert(key.into(), value.into());
    }

    /// Value of a device, if known
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().get(key).cloned()
    }

    /// Value of a device, or `default` when unknown
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Independent copy of every known value
    pub fn get_all(&self) -> HashMap<String, String> {
        self.inner.lock().clone()
    }

    /// Number of known devices
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if nothing is known yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
