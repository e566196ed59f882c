//! Entry lifecycle (insert, pending → finalized) and time-ordered reads.

use chrono::{Local, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::sync::atomic::Ordering;

use super::types::{serialize_embedding, ms_to_datetime, EntryRow, ENTRY_COLUMNS};
use super::{Entry, EntryId, EntryMeta, EntryStatus, IndexStats, MetadataIndex, NewEntry, TimeRange};
use crate::error::{RecallError, Result};

impl MetadataIndex {
    /// Insert a finalized entry and return its id.
    ///
    /// Idempotent on (monitor, timestamp, frame): a retry returns the id of the
    /// row already stored. If that row is still pending it is finalized with
    /// the supplied text and embedding.
    pub fn insert(&self, entry: &NewEntry) -> Result<EntryId> {
        let fn_start = std::time::Instant::now();
        let id = self.with_writer("insert", |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| RecallError::storage(format!("Failed to start transaction: {}", e)))?;

            let (id, inserted) =
                Self::insert_row(&tx, &entry.meta, EntryStatus::Finalized, Some(entry))?;
            if inserted {
                Self::index_text(&tx, id, &entry.text)?;
                self.entry_count.fetch_add(1, Ordering::Relaxed);
            } else {
                Self::finalize_row(&tx, id, &entry.text, entry.embedding.as_deref())?;
            }

            tx.commit()
                .map_err(|e| RecallError::storage(format!("Failed to commit entry: {}", e)))?;
            Ok(id)
        })?;

        if fn_start.elapsed().as_millis() >= 500 {
            tracing::warn!("[DIAG:DB] insert id={} took {:?}", id, fn_start.elapsed());
        }
        Ok(id)
    }

    /// Record an accepted frame whose extraction has not finished yet.
    pub fn insert_pending(&self, meta: &EntryMeta) -> Result<EntryId> {
        self.with_writer("insert_pending", |conn| {
            let (id, inserted) = Self::insert_row(conn, meta, EntryStatus::Pending, None)?;
            if inserted {
                self.entry_count.fetch_add(1, Ordering::Relaxed);
            } else {
                tracing::debug!(
                    "Entry for frame {} on {} already recorded as {}",
                    meta.frame_hash,
                    meta.monitor_id,
                    id
                );
            }
            Ok(id)
        })
    }

    /// One-time pending → finalized transition. Returns false when the entry
    /// was already finalized (the stored content is left untouched).
    pub fn finalize(&self, id: EntryId, text: &str, embedding: Option<&[f32]>) -> Result<bool> {
        self.with_writer("finalize", |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| RecallError::storage(format!("Failed to start transaction: {}", e)))?;

            let status: Option<String> = tx
                .query_row("SELECT status FROM entries WHERE id = ?", params![id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(|e| RecallError::storage(format!("Failed to query entry: {}", e)))?;

            let changed = match status.as_deref() {
                None => return Err(RecallError::storage(format!("Entry {} not found", id))),
                Some("finalized") => false,
                Some(_) => Self::finalize_row(&tx, id, text, embedding)?,
            };

            tx.commit()
                .map_err(|e| RecallError::storage(format!("Failed to commit finalize: {}", e)))?;
            Ok(changed)
        })
    }

    /// Returns (id, true) for a new row, (existing id, false) on a uniqueness hit.
    fn insert_row(
        conn: &Connection,
        meta: &EntryMeta,
        status: EntryStatus,
        content: Option<&NewEntry>,
    ) -> Result<(EntryId, bool)> {
        let text = content.map(|c| c.text.as_str()).unwrap_or("");
        let embedding_blob = content
            .and_then(|c| c.embedding.as_deref())
            .map(serialize_embedding);
        let timestamp_ms = meta.timestamp.timestamp_millis();
        let monitor_id = meta.monitor_id.0 as i64;

        let inserted = conn
            .execute(
                "INSERT INTO entries (
                    timestamp_ms, monitor_id, app_name, window_title, text, embedding,
                    frame_hash, width, height, status, finalized_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                           CASE WHEN ?10 = 'finalized' THEN CURRENT_TIMESTAMP END)
                 ON CONFLICT(monitor_id, timestamp_ms, frame_hash) DO NOTHING",
                params![
                    timestamp_ms,
                    monitor_id,
                    &meta.app_name,
                    &meta.window_title,
                    text,
                    embedding_blob,
                    &meta.frame_hash,
                    meta.width.map(|w| w as i64),
                    meta.height.map(|h| h as i64),
                    status.as_str(),
                ],
            )
            .map_err(|e| RecallError::storage(format!("Failed to insert entry: {}", e)))?;

        if inserted > 0 {
            // The writer mutex is held, so last_insert_rowid belongs to this insert.
            return Ok((conn.last_insert_rowid(), true));
        }

        let existing: EntryId = conn
            .query_row(
                "SELECT id FROM entries WHERE monitor_id = ? AND timestamp_ms = ? AND frame_hash = ?",
                params![monitor_id, timestamp_ms, &meta.frame_hash],
                |row| row.get(0),
            )
            .map_err(|e| RecallError::storage(format!("Failed to resolve existing entry: {}", e)))?;
        Ok((existing, false))
    }

    /// Write extraction output onto a pending row and index its text.
    fn finalize_row(
        conn: &Connection,
        id: EntryId,
        text: &str,
        embedding: Option<&[f32]>,
    ) -> Result<bool> {
        let updated = conn
            .execute(
                "UPDATE entries SET text = ?, embedding = ?, status = 'finalized',
                        finalized_at = CURRENT_TIMESTAMP
                 WHERE id = ? AND status = 'pending'",
                params![text, embedding.map(serialize_embedding), id],
            )
            .map_err(|e| RecallError::storage(format!("Failed to finalize entry: {}", e)))?;
        if updated > 0 {
            Self::index_text(conn, id, text)?;
        }
        Ok(updated > 0)
    }

    pub fn get_entry(&self, id: EntryId) -> Result<Option<Entry>> {
        let row = self.with_reader(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM entries WHERE id = ?", ENTRY_COLUMNS),
                params![id],
                EntryRow::from_row,
            )
            .optional()
            .map_err(|e| RecallError::storage(format!("Failed to query entry: {}", e)))
        })?;
        Ok(row.map(EntryRow::into_entry))
    }

    /// Entries inside `range`, newest first, ties broken by id descending.
    pub fn query_by_time(&self, range: &TimeRange) -> Result<Vec<Entry>> {
        self.query_by_time_limited(range, None)
    }

    pub fn query_by_time_limited(
        &self,
        range: &TimeRange,
        max_records: Option<usize>,
    ) -> Result<Vec<Entry>> {
        range.validate()?;
        let diag_start = std::time::Instant::now();
        let (start_ms, end_ms) = range.bounds_ms();
        let limit = max_records.map(|n| n as i64).unwrap_or(-1);

        // Hold the connection only for the SQL query; decode embeddings afterwards.
        let rows: Vec<EntryRow> = self.with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {} FROM entries
                     WHERE timestamp_ms BETWEEN ?1 AND ?2
                     ORDER BY timestamp_ms DESC, id DESC
                     LIMIT ?3",
                    ENTRY_COLUMNS
                ))
                .map_err(|e| RecallError::storage(format!("Failed to prepare query: {}", e)))?;
            let rows = stmt
                .query_map(params![start_ms, end_ms, limit], EntryRow::from_row)
                .map_err(|e| RecallError::storage(format!("Failed to execute query: {}", e)))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| RecallError::storage(format!("Failed to read entry row: {}", e)))?;
            Ok(rows)
        })?;

        let entries: Vec<Entry> = rows.into_iter().map(EntryRow::into_entry).collect();
        if diag_start.elapsed().as_secs() >= 5 {
            tracing::warn!(
                "[DIAG:DB] query_by_time({} ~ {}) returned {} entries in {:?}",
                range.start,
                range.end,
                entries.len(),
                diag_start.elapsed()
            );
        }
        Ok(entries)
    }

    /// Entries whose extraction never completed, oldest first.
    pub fn pending_entries(&self, max_records: usize) -> Result<Vec<Entry>> {
        let rows: Vec<EntryRow> = self.with_reader(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM entries WHERE status = 'pending'
                     ORDER BY id ASC LIMIT ?",
                    ENTRY_COLUMNS
                ))
                .map_err(|e| RecallError::storage(format!("Failed to prepare query: {}", e)))?;
            let rows = stmt
                .query_map(params![max_records as i64], EntryRow::from_row)
                .map_err(|e| RecallError::storage(format!("Failed to execute query: {}", e)))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| RecallError::storage(format!("Failed to read entry row: {}", e)))?;
            Ok(rows)
        })?;
        Ok(rows.into_iter().map(EntryRow::into_entry).collect())
    }

    /// (id, text) of finalized entries with id greater than `after_id`,
    /// ascending, at most `max_records`.
    pub fn finalized_texts_after(
        &self,
        after_id: EntryId,
        max_records: usize,
    ) -> Result<Vec<(EntryId, String)>> {
        self.with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT id, text FROM entries
                     WHERE status = 'finalized' AND id > ?
                     ORDER BY id ASC LIMIT ?",
                )
                .map_err(|e| RecallError::storage(format!("Failed to prepare query: {}", e)))?;
            let rows = stmt
                .query_map(params![after_id, max_records as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .map_err(|e| RecallError::storage(format!("Failed to execute query: {}", e)))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| RecallError::storage(format!("Failed to read entry text: {}", e)))?;
            Ok(rows)
        })
    }

    /// Replace the embedding of a finalized entry. Returns false when the
    /// entry does not exist or is still pending.
    pub fn update_embedding(&self, id: EntryId, embedding: Option<&[f32]>) -> Result<bool> {
        self.with_writer("update_embedding", |conn| {
            let updated = conn
                .execute(
                    "UPDATE entries SET embedding = ? WHERE id = ? AND status = 'finalized'",
                    params![embedding.map(serialize_embedding), id],
                )
                .map_err(|e| RecallError::storage(format!("Failed to update embedding: {}", e)))?;
            Ok(updated > 0)
        })
    }

    /// Every frame hash some entry points at.
    pub fn referenced_frames(&self) -> Result<HashSet<String>> {
        self.with_reader(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT frame_hash FROM entries")
                .map_err(|e| RecallError::storage(format!("Failed to prepare query: {}", e)))?;
            let hashes = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| RecallError::storage(format!("Failed to execute query: {}", e)))?
                .collect::<rusqlite::Result<HashSet<_>>>()
                .map_err(|e| RecallError::storage(format!("Failed to read frame hash: {}", e)))?;
            Ok(hashes)
        })
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let today_start = Local::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|dt| Local.from_local_datetime(&dt).earliest())
            .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
            .unwrap_or(0);

        self.with_reader(|conn| {
            let (total, pending, no_embedding, today, first, last): (
                i64,
                i64,
                i64,
                i64,
                Option<i64>,
                Option<i64>,
            ) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(status = 'pending'), 0),
                            COALESCE(SUM(embedding IS NULL), 0),
                            COALESCE(SUM(timestamp_ms >= ?), 0),
                            MIN(timestamp_ms),
                            MAX(timestamp_ms)
                     FROM entries",
                    params![today_start],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    },
                )
                .map_err(|e| RecallError::storage(format!("Failed to compute stats: {}", e)))?;

            Ok(IndexStats {
                total_entries: total,
                pending_entries: pending,
                entries_without_embedding: no_embedding,
                entries_today: today,
                first_timestamp: first.map(ms_to_datetime),
                last_timestamp: last.map(ms_to_datetime),
            })
        })
    }

    /// Distinct local calendar dates that have at least one entry, newest first.
    pub fn entry_dates(&self) -> Result<Vec<chrono::NaiveDate>> {
        let timestamps: Vec<i64> = self.with_reader(|conn| {
            let mut stmt = conn
                .prepare("SELECT timestamp_ms FROM entries ORDER BY timestamp_ms DESC")
                .map_err(|e| RecallError::storage(format!("Failed to prepare query: {}", e)))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, i64>(0))
                .map_err(|e| RecallError::storage(format!("Failed to execute query: {}", e)))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| RecallError::storage(format!("Failed to read timestamp: {}", e)))?;
            Ok(rows)
        })?;

        let mut dates: Vec<chrono::NaiveDate> = Vec::new();
        for ms in timestamps {
            let date = ms_to_datetime(ms).with_timezone(&Local).date_naive();
            if dates.last() != Some(&date) {
                dates.push(date);
            }
        }
        Ok(dates)
    }
}
