//! Position ledger: one record per liquidity position.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::{JsonFile, Persisted};
use crate::position::PositionRecord;

type Records = BTreeMap<String, PositionRecord>;

#[derive(Debug)]
pub struct PositionLedger {
    inner: Persisted<Records>,
}

impl PositionLedger {
    pub fn open(file: JsonFile) -> Result<Self> {
        Ok(Self {
            inner: Persisted::open(file)?,
        })
    }

    pub fn get(&self, position_id: &str) -> Option<PositionRecord> {
        self.inner.read(|records| records.get(position_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.read(|records| records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<PositionRecord> {
        self.inner.read(|records| records.values().cloned().collect())
    }

    pub fn open_records(&self) -> Vec<PositionRecord> {
        self.inner
            .read(|records| records.values().filter(|r| !r.is_closed()).cloned().collect())
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: PositionRecord) -> Result<()> {
        self.inner.write(|records| {
            records.insert(record.position_id.clone(), record);
        })
    }

    /// Load the record, or create and persist it with `init`.
    pub fn get_or_insert(&self, position_id: &str, init: impl FnOnce() -> PositionRecord) -> Result<PositionRecord> {
        if let Some(existing) = self.get(position_id) {
            return Ok(existing);
        }
        self.inner.write(|records| {
            records
                .entry(position_id.to_string())
                .or_insert_with(init)
                .clone()
        })
    }

    /// Mutate a record in place. Returns None when the record is unknown.
    pub fn update<R>(&self, position_id: &str, f: impl FnOnce(&mut PositionRecord) -> R) -> Result<Option<R>> {
        if self.get(position_id).is_none() {
            return Ok(None);
        }
        self.inner.write(|records| records.get_mut(position_id).map(f))
    }

    /// Flag every closed, unsettled record of `owner` holding `base_mint` as
    /// settled. A single swap converts the whole balance, so all of them are.
    pub fn mark_settled(&self, base_mint: &str, owner_id: &str) -> Result<usize> {
        let matches = |r: &PositionRecord| {
            r.is_closed() && !r.swap_settled && r.base_mint == base_mint && r.owner_id == owner_id
        };
        if self.inner.read(|records| !records.values().any(matches)) {
            return Ok(0);
        }
        self.inner.write(|records| {
            let mut settled = 0;
            for record in records.values_mut().filter(|r| matches(r)) {
                record.swap_settled = true;
                settled += 1;
            }
            settled
        })
    }

    /// Drop closed records whose close (or last sighting) predates `cutoff`.
    pub fn gc(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let stale = self.inner.read(|records| {
            records
                .values()
                .filter(|r| r.is_closed() && r.closed_at().unwrap_or(r.last_seen_at) < cutoff)
                .count()
        });
        if stale == 0 {
            return Ok(0);
        }
        self.inner.write(|records| {
            let before = records.len();
            records.retain(|_, r| !(r.is_closed() && r.closed_at().unwrap_or(r.last_seen_at) < cutoff));
            before - records.len()
        })
    }
}
