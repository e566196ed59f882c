//! Storage Management Module - SQLite metadata index and content-addressed frame files
//!
//! This module provides:
//! 1. The frame store (raw encoded screenshots on disk)
//! 2. Entry rows binding a frame to its extracted text and embedding
//! 3. Time, text (bigram bitmap index) and vector queries over entries

mod entries;
mod frames;
mod process;
mod schema;
mod search;
mod types;

pub use frames::{FrameStore, ReconcileReport};
pub use search::{cosine_similarity, MAX_RESULT_LIMIT};
pub use types::*;

use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{RecallError, Result};

/// Read-only connections kept around for reuse.
const MAX_IDLE_READERS: usize = 4;

/// MetadataIndex owns the SQLite database: one writer connection that
/// serializes inserts and a small pool of read-only connections so that
/// searches proceed while an insert is in flight (WAL mode).
pub struct MetadataIndex {
    db_path: PathBuf,
    /// Writer connection
    db: Mutex<Option<Connection>>,
    readers: Mutex<Vec<Connection>>,
    initialized: Mutex<bool>,
    /// Diagnostic: tracks which operation currently holds the writer mutex
    lock_holder: Mutex<&'static str>,
    /// Approximate entry count, maintained on insert
    entry_count: AtomicU64,
}

impl MetadataIndex {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            db: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
            initialized: Mutex::new(false),
            lock_holder: Mutex::new(""),
            entry_count: AtomicU64::new(0),
        }
    }

    /// Create and initialize in one step.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let index = Self::new(db_path);
        index.initialize()?;
        Ok(index)
    }

    pub fn approximate_len(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// Acquire the writer connection with caller identification for diagnostic logging.
    fn get_connection_named(
        &self,
        caller: &'static str,
    ) -> Result<MutexGuard<'_, Option<Connection>>> {
        let wait_start = std::time::Instant::now();
        let current_holder = self.lock_holder.lock().map(|g| *g).unwrap_or("?");
        let guard = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let wait_dur = wait_start.elapsed();
        if let Ok(mut h) = self.lock_holder.lock() {
            *h = caller;
        }
        if wait_dur.as_secs() >= 10 {
            tracing::warn!(
                "[DIAG:DB] Mutex wait took {:?} for '{}' (was held by '{}')",
                wait_dur,
                caller,
                current_holder
            );
        }
        if guard.is_none() {
            return Err(RecallError::storage("Database not initialized"));
        }
        Ok(guard)
    }

    fn release_holder(&self) {
        if let Ok(mut h) = self.lock_holder.lock() {
            *h = "";
        }
    }

    /// Run `f` on the writer connection.
    fn with_writer<T>(
        &self,
        caller: &'static str,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.get_connection_named(caller)?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| RecallError::storage("Database not initialized"))?;
        let result = f(conn);
        self.release_holder();
        result
    }

    /// Run `f` on a pooled read-only connection.
    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if !*self.initialized.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(RecallError::storage("Database not initialized"));
        }
        let pooled = self
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        let conn = match pooled {
            Some(c) => c,
            None => self.open_reader()?,
        };

        let result = f(&conn);

        let mut readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());
        if readers.len() < MAX_IDLE_READERS {
            readers.push(conn);
        }
        result
    }
}
