//! JSON-lines file sink.
//!
//! Each chained entry is written as one line of compact JSON. The file can
//! be read back with `read_chain` and checked with `verify_chain`.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, info};

use rok_contracts::{
    audit::LogEvent,
    error::{RokError, RokResult},
};
use rok_core::traits::AuditSink;

use crate::{event::ChainedEvent, memory::ChainState};

fn write_failed(reason: String) -> RokError {
    RokError::AuditWriteFailed { reason }
}

struct FileState {
    chain: ChainState,
    writer: BufWriter<File>,
}

/// Appends hash-chained entries to a file, one JSON object per line.
///
/// The file is truncated on creation; one sink owns one chain.
pub struct JsonLinesAuditSink {
    chain_id: String,
    path: PathBuf,
    state: Mutex<FileState>,
}

impl JsonLinesAuditSink {
    pub fn create(path: impl AsRef<Path>, chain_id: impl Into<String>) -> RokResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| write_failed(format!("failed to create {}: {e}", parent.display())))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| write_failed(format!("failed to open {}: {e}", path.display())))?;
        Ok(Self {
            chain_id: chain_id.into(),
            path,
            state: Mutex::new(FileState {
                chain: ChainState::new(),
                writer: BufWriter::new(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> RokResult<std::sync::MutexGuard<'_, FileState>> {
        self.state
            .lock()
            .map_err(|e| write_failed(format!("audit file lock poisoned: {e}")))
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn emit(&self, event: &LogEvent) -> RokResult<()> {
        let mut state = self.lock()?;
        let entry = state.chain.append(&self.chain_id, event);
        let line = serde_json::to_string(&entry)
            .map_err(|e| write_failed(format!("failed to serialize audit entry: {e}")))?;
        writeln!(state.writer, "{line}")
            .map_err(|e| write_failed(format!("failed to write {}: {e}", self.path.display())))?;
        debug!(position = entry.position, event_type = ?event.event_type, "audit entry written");
        Ok(())
    }

    fn flush(&self) -> RokResult<()> {
        let mut state = self.lock()?;
        state
            .writer
            .flush()
            .map_err(|e| write_failed(format!("failed to flush {}: {e}", self.path.display())))?;
        info!(
            path = %self.path.display(),
            event_count = state.chain.events.len(),
            terminal_hash = %state.chain.last_hash,
            "audit file flushed"
        );
        Ok(())
    }
}

/// Read every entry from a JSON-lines audit file. Blank lines are skipped.
pub fn read_chain(path: impl AsRef<Path>) -> RokResult<Vec<ChainedEvent>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| RokError::Storage {
        reason: format!("failed to open {}: {e}", path.display()),
    })?;
    let mut entries = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| RokError::Storage {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line).map_err(|e| RokError::Storage {
            reason: format!("{}:{}: invalid audit entry: {e}", path.display(), n + 1),
        })?;
        entries.push(entry);
    }
    Ok(entries)
}
