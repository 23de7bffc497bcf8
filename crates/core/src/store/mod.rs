//! Durable state store.
//!
//! Every store is a JSON document on disk mirrored by an in-memory copy
//! behind a mutex. Mutations are applied to a copy, written to a temp file,
//! fsynced and renamed over the old file, and only then become visible in
//! memory. A failed write leaves both copies untouched.

mod cooldown;
mod force_exit;
mod ledger;
mod swap_queue;

pub use cooldown::CooldownRegistry;
pub use force_exit::ForceExitQueue;
pub use ledger::PositionLedger;
pub use swap_queue::{SwapRetryEntry, SwapRetryQueue};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A JSON file with atomic replacement.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document. A missing file yields the default value.
    pub fn load<T: DeserializeOwned + Default>(&self) -> Result<T> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(T::default()),
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("corrupt state file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", self.path.display())),
        }
    }

    /// Write the document: temp file, fsync, rename.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec_pretty(value)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file =
                fs::File::create(&tmp_path).with_context(|| format!("failed to create {}", tmp_path.display()))?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            anyhow::anyhow!("atomic rename to {} failed: {}", self.path.display(), e)
        })?;
        Ok(())
    }
}

/// In-memory document kept in step with its file.
#[derive(Debug)]
pub(crate) struct Persisted<T> {
    file: JsonFile,
    state: Mutex<T>,
}

impl<T> Persisted<T>
where
    T: Serialize + DeserializeOwned + Default + Clone,
{
    pub(crate) fn open(file: JsonFile) -> Result<Self> {
        let state = file.load()?;
        Ok(Self {
            file,
            state: Mutex::new(state),
        })
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.state.lock())
    }

    /// Apply a mutation and persist it. The closure's result is returned
    /// only once the new document is on disk.
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut guard = self.state.lock();
        let mut next = guard.clone();
        let result = f(&mut next);
        self.file.save(&next)?;
        *guard = next;
        Ok(result)
    }

    /// Fold the current file contents into memory. For documents that other
    /// processes also edit.
    pub(crate) fn refresh(&self, merge: impl FnOnce(&mut T, T)) -> Result<()> {
        let mut guard = self.state.lock();
        let on_disk = self.file.load()?;
        merge(&mut guard, on_disk);
        Ok(())
    }

    /// Like [`Persisted::write`], with the file re-read and merged first so
    /// outside edits are not overwritten.
    pub(crate) fn write_merged<R>(&self, merge: impl FnOnce(&mut T, T), f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut guard = self.state.lock();
        let mut next = guard.clone();
        merge(&mut next, self.file.load()?);
        let result = f(&mut next);
        self.file.save(&next)?;
        *guard = next;
        Ok(result)
    }
}

/// All engine state, opened from one data directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    pub ledger: Arc<PositionLedger>,
    pub cooldowns: Arc<CooldownRegistry>,
    pub force_exits: Arc<ForceExitQueue>,
    pub swap_retries: Arc<SwapRetryQueue>,
}

impl StateStore {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("failed to create data dir {}", dir.display()))?;

        let store = Self {
            ledger: Arc::new(PositionLedger::open(JsonFile::new(dir.join("positions.json")))?),
            cooldowns: Arc::new(CooldownRegistry::open(JsonFile::new(dir.join("cooldowns.json")))?),
            force_exits: Arc::new(ForceExitQueue::open(JsonFile::new(dir.join("force_exit.json")))?),
            swap_retries: Arc::new(SwapRetryQueue::open(JsonFile::new(dir.join("swap_retry.json")))?),
        };

        info!(
            dir = %dir.display(),
            positions = store.ledger.len(),
            cooldowns = store.cooldowns.len(),
            force_exits = store.force_exits.len(),
            swap_retries = store.swap_retries.len(),
            "State store opened"
        );
        debug!(open = store.ledger.open_records().len(), "Open positions in ledger");
        Ok(store)
    }
}
