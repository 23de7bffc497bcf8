//! Externally requested exits.
//!
//! An operator (or another process) adds a position id to
//! `force_exit.json` while the engine runs. The monitor folds the file into
//! memory at the start of every cycle and consumes a request once its exit
//! fires. Every write re-reads the file first so outside additions survive.

use anyhow::Result;
use std::collections::BTreeSet;

use super::{JsonFile, Persisted};

#[derive(Debug)]
pub struct ForceExitQueue {
    inner: Persisted<BTreeSet<String>>,
}

impl ForceExitQueue {
    pub fn open(file: JsonFile) -> Result<Self> {
        Ok(Self {
            inner: Persisted::open(file)?,
        })
    }

    pub fn request(&self, position_id: &str) -> Result<bool> {
        self.inner
            .write_merged(union, |set| set.insert(position_id.to_string()))
    }

    /// Pick up requests written to the file since the last read.
    pub fn refresh(&self) -> Result<()> {
        self.inner.refresh(union)
    }

    pub fn contains(&self, position_id: &str) -> bool {
        self.inner.read(|set| set.contains(position_id))
    }

    /// Consume a request. Returns false if there was none.
    pub fn take(&self, position_id: &str) -> Result<bool> {
        self.inner.write_merged(union, |set| set.remove(position_id))
    }

    pub fn pending(&self) -> Vec<String> {
        self.inner.read(|set| set.iter().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.inner.read(|set| set.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn union(memory: &mut BTreeSet<String>, on_disk: BTreeSet<String>) {
    memory.extend(on_disk);
}
