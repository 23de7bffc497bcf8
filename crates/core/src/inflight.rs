//! Positions currently being processed.
//!
//! The monitor, reconciliation and sweeps all run concurrently. Whoever
//! acquires a position's guard owns it until the guard drops.

use dashmap::DashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
    keys: Arc<DashSet<String>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`. Returns None if someone else holds it.
    pub fn try_acquire(&self, key: &str) -> Option<InFlightGuard> {
        if self.keys.insert(key.to_string()) {
            Some(InFlightGuard {
                keys: Arc::clone(&self.keys),
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    keys: Arc<DashSet<String>>,
    key: String,
}

impl InFlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}
