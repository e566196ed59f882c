//! Data type definitions for the storage module.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RecallError, Result};

pub type EntryId = i64;

/// Identifies one physical display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitorId(pub u32);

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "monitor-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Frame stored, extraction not yet persisted.
    Pending,
    Finalized,
}

impl EntryStatus {
    pub(super) fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Finalized => "finalized",
        }
    }

    pub(super) fn parse(s: &str) -> Self {
        match s {
            "finalized" => Self::Finalized,
            _ => Self::Pending,
        }
    }
}

/// One row of the `entries` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub timestamp: DateTime<Utc>,
    pub monitor_id: MonitorId,
    pub app_name: String,
    pub window_title: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Content hash of the frame in the frame store.
    pub frame_hash: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub status: EntryStatus,
}

impl Entry {
    /// First `max_chars` characters of the text, for result lists.
    pub fn snippet(&self, max_chars: usize) -> String {
        let mut chars = self.text.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{}…", head)
        } else {
            head
        }
    }
}

/// Everything known about a frame at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub timestamp: DateTime<Utc>,
    pub monitor_id: MonitorId,
    pub app_name: String,
    pub window_title: String,
    pub frame_hash: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// A complete entry ready for a one-shot finalized insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub meta: EntryMeta,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

/// Inclusive time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    /// The whole representable timeline.
    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.start > self.end {
            return Err(RecallError::invalid_query(format!(
                "time range start {} is after end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }

    pub(super) fn bounds_ms(&self) -> (i64, i64) {
        (self.start.timestamp_millis(), self.end.timestamp_millis())
    }
}

/// Aggregate counts over the index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_entries: i64,
    pub pending_entries: i64,
    pub entries_without_embedding: i64,
    pub entries_today: i64,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppUsage {
    pub app_name: String,
    pub entries: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

pub(super) fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn deserialize_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

/// Column list shared by every SELECT that feeds `EntryRow::from_row`.
pub(super) const ENTRY_COLUMNS: &str = "id, timestamp_ms, monitor_id, app_name, window_title, text, \
     embedding, frame_hash, width, height, status";

/// Raw row data, converted to `Entry` after the connection is released.
pub(super) struct EntryRow {
    pub(super) id: i64,
    pub(super) timestamp_ms: i64,
    pub(super) monitor_id: i64,
    pub(super) app_name: String,
    pub(super) window_title: String,
    pub(super) text: String,
    pub(super) embedding: Option<Vec<u8>>,
    pub(super) frame_hash: String,
    pub(super) width: Option<i64>,
    pub(super) height: Option<i64>,
    pub(super) status: String,
}

impl EntryRow {
    /// Column order must match `ENTRY_COLUMNS`.
    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(EntryRow {
            id: row.get(0)?,
            timestamp_ms: row.get(1)?,
            monitor_id: row.get(2)?,
            app_name: row.get(3)?,
            window_title: row.get(4)?,
            text: row.get(5)?,
            embedding: row.get(6)?,
            frame_hash: row.get(7)?,
            width: row.get(8)?,
            height: row.get(9)?,
            status: row.get(10)?,
        })
    }

    pub(super) fn into_entry(self) -> Entry {
        let embedding = self.embedding.as_deref().and_then(|blob| {
            let decoded = deserialize_embedding(blob);
            if decoded.is_none() {
                tracing::warn!("Entry {} has a malformed embedding blob, ignoring", self.id);
            }
            decoded
        });

        Entry {
            id: self.id,
            timestamp: ms_to_datetime(self.timestamp_ms),
            monitor_id: MonitorId(self.monitor_id as u32),
            app_name: self.app_name,
            window_title: self.window_title,
            text: self.text,
            embedding,
            frame_hash: self.frame_hash,
            width: self.width.map(|w| w as u32),
            height: self.height.map(|h| h as u32),
            status: EntryStatus::parse(&self.status),
        }
    }
}
