//! Memory stores.
//!
//! Memory is a flat list of `MemoryWrite`s shared across runs. The
//! consistency checker reads it; the finalizer appends verified facts.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing::debug;

use rok_contracts::{
    conclusion::MemoryWrite,
    error::{RokError, RokResult},
};

use crate::traits::MemoryStore;

// ── InMemoryMemoryStore ──────────────────────────────────────────────────────

/// A process-local store, mostly for tests and scenario wiring.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMemoryStore {
    items: Arc<Mutex<Vec<MemoryWrite>>>,
}

impl InMemoryMemoryStore {
    pub fn with_items(items: Vec<MemoryWrite>) -> Self {
        Self {
            items: Arc::new(Mutex::new(items)),
        }
    }
}

impl MemoryStore for InMemoryMemoryStore {
    fn load(&self) -> RokResult<Vec<MemoryWrite>> {
        let guard = self.items.lock().map_err(|e| RokError::Storage {
            reason: format!("memory lock poisoned: {e}"),
        })?;
        Ok(guard.clone())
    }

    fn append(&self, writes: &[MemoryWrite]) -> RokResult<()> {
        let mut guard = self.items.lock().map_err(|e| RokError::Storage {
            reason: format!("memory lock poisoned: {e}"),
        })?;
        guard.extend_from_slice(writes);
        Ok(())
    }
}

// ── JsonFileMemoryStore ──────────────────────────────────────────────────────

/// A JSON array on disk. A missing or empty file is an empty memory.
#[derive(Debug)]
pub struct JsonFileMemoryStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl JsonFileMemoryStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> RokResult<Vec<MemoryWrite>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| RokError::Storage {
            reason: format!("failed to read {}: {e}", self.path.display()),
        })?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|e| RokError::Storage {
            reason: format!("failed to parse {}: {e}", self.path.display()),
        })
    }
}

impl MemoryStore for JsonFileMemoryStore {
    fn load(&self) -> RokResult<Vec<MemoryWrite>> {
        let _guard = self.lock.lock().map_err(|e| RokError::Storage {
            reason: format!("memory lock poisoned: {e}"),
        })?;
        self.read_all()
    }

    fn append(&self, writes: &[MemoryWrite]) -> RokResult<()> {
        let _guard = self.lock.lock().map_err(|e| RokError::Storage {
            reason: format!("memory lock poisoned: {e}"),
        })?;
        let mut items = self.read_all()?;
        items.extend_from_slice(writes);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| RokError::Storage {
                reason: format!("failed to create {}: {e}", parent.display()),
            })?;
        }
        let json = serde_json::to_string_pretty(&items).map_err(|e| RokError::Storage {
            reason: format!("failed to serialize memory: {e}"),
        })?;
        fs::write(&self.path, json).map_err(|e| RokError::Storage {
            reason: format!("failed to write {}: {e}", self.path.display()),
        })?;
        debug!(path = %self.path.display(), total = items.len(), appended = writes.len(), "memory written");
        Ok(())
    }
}
