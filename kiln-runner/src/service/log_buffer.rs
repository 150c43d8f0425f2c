//! Log buffer service
//!
//! Collects execution-log entries while commands run and hands finished
//! entries to the log sender, which ships them to the control plane.

use chrono::Utc;
use kiln_core::domain::log::ExecutionLogEntry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Handle of an open log entry
pub type EntryId = u64;

/// Service for managing execution-log buffers
///
/// One buffer belongs to one build. Commands open an entry, append output
/// lines while they run, and finalize it with their exit code.
pub trait LogBufferService: Send + Sync {
    /// Opens a new entry and returns its handle
    ///
    /// # Arguments
    /// * `key` - Correlation key (e.g. `step.0.build`)
    /// * `command` - The argv being executed
    fn open(&self, key: &str, command: Vec<String>) -> EntryId;

    /// Appends one output line to an open entry
    fn append(&self, id: EntryId, line: &str);

    /// Records the exit code and duration of an entry
    fn finalize(&self, id: EntryId, exit_code: i32);

    /// Removes and returns every finalized entry, in opening order
    fn drain(&self) -> Vec<ExecutionLogEntry>;

    /// Removes and returns every entry, finalized or not
    fn drain_all(&self) -> Vec<ExecutionLogEntry>;

    /// Records an entry that is already finished
    fn record(&self, key: &str, command: Vec<String>, out: &str, exit_code: i32) {
        let id = self.open(key, command);
        if !out.is_empty() {
            self.append(id, out);
        }
        self.finalize(id, exit_code);
    }
}

/// In-memory implementation of LogBufferService
#[derive(Clone, Default)]
pub struct InMemoryLogBuffer {
    entries: Arc<Mutex<BTreeMap<EntryId, ExecutionLogEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl InMemoryLogBuffer {
    /// Creates a new in-memory log buffer
    pub fn new() -> Self {
        Self::default()
    }

}

impl LogBufferService for InMemoryLogBuffer {
    fn open(&self, key: &str, command: Vec<String>) -> EntryId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(id, ExecutionLogEntry::new(key, command));
        id
    }

    fn append(&self, id: EntryId, line: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&id) {
            entry.out.push_str(line);
            if !line.ends_with('\n') {
                entry.out.push('\n');
            }
        }
    }

    fn finalize(&self, id: EntryId, exit_code: i32) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&id) {
            entry.exit_code = Some(exit_code);
            entry.duration_ms = Some((Utc::now() - entry.started_at).num_milliseconds());
        }
    }

    fn drain(&self) -> Vec<ExecutionLogEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let finished: Vec<EntryId> = entries
            .iter()
            .filter(|(_, entry)| entry.is_finalized())
            .map(|(id, _)| *id)
            .collect();
        finished
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .collect()
    }

    fn drain_all(&self) -> Vec<ExecutionLogEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *entries).into_values().collect()
    }
}
