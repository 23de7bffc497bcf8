//! Per-asset re-entry cooldowns.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::{JsonFile, Persisted};

#[derive(Debug)]
pub struct CooldownRegistry {
    inner: Persisted<BTreeMap<String, DateTime<Utc>>>,
}

impl CooldownRegistry {
    pub fn open(file: JsonFile) -> Result<Self> {
        Ok(Self {
            inner: Persisted::open(file)?,
        })
    }

    /// Lock an asset until `until`. An existing later lock is kept.
    pub fn set(&self, asset: &str, until: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.inner.write(|map| {
            let entry = map.entry(asset.to_string()).or_insert(until);
            if until > *entry {
                *entry = until;
            }
            *entry
        })
    }

    pub fn until(&self, asset: &str) -> Option<DateTime<Utc>> {
        self.inner.read(|map| map.get(asset).copied())
    }

    pub fn is_cooling(&self, asset: &str, now: DateTime<Utc>) -> bool {
        self.until(asset).is_some_and(|until| until > now)
    }

    pub fn len(&self) -> usize {
        self.inner.read(|map| map.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.inner.read(|map| map.values().filter(|until| **until <= now).count());
        if expired == 0 {
            return Ok(0);
        }
        self.inner.write(|map| {
            map.retain(|_, until| *until > now);
            expired
        })
    }
}
