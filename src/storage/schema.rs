//! Database initialization, table creation, and schema migration.

use rusqlite::{Connection, OpenFlags};
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::MetadataIndex;
use crate::error::{RecallError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl MetadataIndex {
    /// Initialize storage (create parent directory, open database, create tables).
    pub fn initialize(&self) -> Result<()> {
        let init_start = std::time::Instant::now();
        let mut initialized = self.initialized.lock().unwrap_or_else(|e| e.into_inner());
        if *initialized {
            return Ok(());
        }

        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RecallError::storage(format!("Failed to create data directory: {}", e))
            })?;
        }

        let conn = Connection::open(&self.db_path)
            .map_err(|e| RecallError::storage(format!("Failed to open database: {}", e)))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RecallError::storage(format!("Failed to enable WAL: {}", e)))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            tracing::warn!("Database journal mode is '{}', readers may block", journal_mode);
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL;")
            .map_err(|e| RecallError::storage(format!("Failed to set pragmas: {}", e)))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| RecallError::storage(format!("Failed to set busy timeout: {}", e)))?;

        self.init_tables(&conn)?;

        // AUTOINCREMENT ids only increase, so MAX(id) >= row count; good enough for diagnostics.
        let approx_count: i64 = conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM entries", [], |row| row.get(0))
            .unwrap_or(0);
        self.entry_count
            .store(approx_count.max(0) as u64, Ordering::Relaxed);

        *self.db.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn);
        *initialized = true;

        tracing::info!(
            "[DIAG:INIT] Metadata index at {} initialized in {:?} (~{} entries)",
            self.db_path.display(),
            init_start.elapsed(),
            approx_count
        );
        Ok(())
    }

    /// Shut down storage: close all connections.
    pub fn shutdown(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().unwrap_or_else(|e| e.into_inner());
        self.readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.db.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *initialized = false;
        Ok(())
    }

    pub(super) fn open_reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| RecallError::storage(format!("Failed to open reader: {}", e)))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| RecallError::storage(format!("Failed to set busy timeout: {}", e)))?;
        Ok(conn)
    }

    fn init_tables(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- One row per accepted frame
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp_ms INTEGER NOT NULL,
                monitor_id INTEGER NOT NULL,
                app_name TEXT NOT NULL DEFAULT '',
                window_title TEXT NOT NULL DEFAULT '',
                text TEXT NOT NULL DEFAULT '',
                embedding BLOB,
                frame_hash TEXT NOT NULL,
                width INTEGER,
                height INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (monitor_id, timestamp_ms, frame_hash)
            );

            -- Lowercased character bigram -> RoaringBitmap of entry ids
            CREATE TABLE IF NOT EXISTS bigram_index (
                token TEXT PRIMARY KEY,
                postings_blob BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_time ON entries(timestamp_ms, id);
            CREATE INDEX IF NOT EXISTS idx_entries_status ON entries(status);
            CREATE INDEX IF NOT EXISTS idx_entries_app ON entries(app_name);
            CREATE INDEX IF NOT EXISTS idx_entries_frame ON entries(frame_hash);
            "#,
        )
        .map_err(|e| RecallError::storage(format!("Failed to initialize tables: {}", e)))?;

        self.ensure_schema(conn)?;
        Ok(())
    }

    /// Add columns introduced after the first schema version.
    fn ensure_schema(&self, conn: &Connection) -> Result<()> {
        Self::add_column_if_missing(conn, "entries", "finalized_at", "TIMESTAMP")?;
        Ok(())
    }

    fn add_column_if_missing(
        conn: &Connection,
        table: &str,
        column: &str,
        column_type: &str,
    ) -> Result<()> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", table))
            .map_err(|e| RecallError::storage(format!("Failed to read table info: {}", e)))?;
        let exists = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| RecallError::storage(format!("Failed to query table info: {}", e)))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(|e| RecallError::storage(format!("Failed to read table info: {}", e)))?
            .iter()
            .any(|name| name == column);

        if !exists {
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, column_type
            ))
            .map_err(|e| {
                RecallError::storage(format!("Failed to add column {}.{}: {}", table, column, e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let index = MetadataIndex::new(dir.path().join("recall.db"));
        index.initialize().unwrap();
        index.initialize().unwrap();
        assert_eq!(index.approximate_len(), 0);
    }

    #[test]
    fn test_reopen_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("recall.db");
        let index = MetadataIndex::open(&path).unwrap();
        index.shutdown().unwrap();
        assert!(index.stats().is_err());
        index.initialize().unwrap();
        assert_eq!(index.stats().unwrap().total_entries, 0);
    }
}
