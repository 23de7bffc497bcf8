//! Balances that failed to convert after their position closed.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{JsonFile, Persisted};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRetryEntry {
    pub asset_id: String,
    pub owner_id: String,
    pub tracked_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl SwapRetryEntry {
    pub fn key(&self) -> String {
        entry_key(&self.asset_id, &self.owner_id)
    }
}

fn entry_key(asset_id: &str, owner_id: &str) -> String {
    format!("{}_{}", asset_id, owner_id)
}

/// Queue keyed by (asset, owner).
#[derive(Debug)]
pub struct SwapRetryQueue {
    inner: Persisted<BTreeMap<String, SwapRetryEntry>>,
}

impl SwapRetryQueue {
    pub fn open(file: JsonFile) -> Result<Self> {
        Ok(Self {
            inner: Persisted::open(file)?,
        })
    }

    /// Track a balance. Re-tracking an existing entry restarts its count.
    pub fn track(&self, asset_id: &str, owner_id: &str, now: DateTime<Utc>) -> Result<()> {
        let entry = SwapRetryEntry {
            asset_id: asset_id.to_string(),
            owner_id: owner_id.to_string(),
            tracked_at: now,
            retry_count: 0,
        };
        self.inner.write(|map| {
            map.insert(entry.key(), entry);
        })
    }

    pub fn contains(&self, asset_id: &str, owner_id: &str) -> bool {
        let key = entry_key(asset_id, owner_id);
        self.inner.read(|map| map.contains_key(&key))
    }

    pub fn entries(&self) -> Vec<SwapRetryEntry> {
        self.inner.read(|map| map.values().cloned().collect())
    }

    /// Bump the retry count, returning the new value.
    pub fn increment(&self, asset_id: &str, owner_id: &str) -> Result<Option<u32>> {
        let key = entry_key(asset_id, owner_id);
        self.inner.write(|map| {
            map.get_mut(&key).map(|entry| {
                entry.retry_count += 1;
                entry.retry_count
            })
        })
    }

    pub fn remove(&self, asset_id: &str, owner_id: &str) -> Result<bool> {
        let key = entry_key(asset_id, owner_id);
        if !self.inner.read(|map| map.contains_key(&key)) {
            return Ok(false);
        }
        self.inner.write(|map| map.remove(&key).is_some())
    }

    pub fn len(&self) -> usize {
        self.inner.read(|map| map.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
