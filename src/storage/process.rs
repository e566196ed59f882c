//! Per-application usage aggregation.

use rusqlite::params;

use super::types::ms_to_datetime;
use super::{AppUsage, MetadataIndex, TimeRange};
use crate::error::{RecallError, Result};

impl MetadataIndex {
    /// Distinct application names with entry counts, most used first
    /// (ties by case-insensitive name). Entries without an app name are skipped.
    pub fn app_usage(&self, range: Option<&TimeRange>) -> Result<Vec<AppUsage>> {
        let fn_start = std::time::Instant::now();
        let range = range.copied().unwrap_or_else(TimeRange::all);
        range.validate()?;
        let (start_ms, end_ms) = range.bounds_ms();

        let rows: Vec<(String, i64, i64, i64)> = self.with_reader(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT app_name, COUNT(*), MIN(timestamp_ms), MAX(timestamp_ms) FROM entries
                     WHERE app_name != '' AND timestamp_ms BETWEEN ? AND ?
                     GROUP BY app_name",
                )
                .map_err(|e| RecallError::storage(format!("Failed to prepare query: {}", e)))?;
            let rows = stmt
                .query_map(params![start_ms, end_ms], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })
                .map_err(|e| RecallError::storage(format!("Failed to execute query: {}", e)))?
                .collect::<rusqlite::Result<Vec<(String, i64, i64, i64)>>>()
                .map_err(|e| RecallError::storage(format!("Failed to read app usage row: {}", e)))?;
            Ok(rows)
        })?;

        let mut results: Vec<AppUsage> = rows
            .into_iter()
            .map(|(app_name, entries, first, last)| AppUsage {
                app_name,
                entries,
                first_seen: ms_to_datetime(first),
                last_seen: ms_to_datetime(last),
            })
            .collect();
        results.sort_by(|a, b| {
            b.entries
                .cmp(&a.entries)
                .then_with(|| a.app_name.to_lowercase().cmp(&b.app_name.to_lowercase()))
        });

        if fn_start.elapsed().as_millis() >= 500 {
            tracing::info!(
                "[DIAG:DB] app_usage total={:?} groups={}",
                fn_start.elapsed(),
                results.len()
            );
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EntryMeta, MonitorId};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn pending(index: &MetadataIndex, secs: i64, app: &str) {
        index
            .insert_pending(&EntryMeta {
                timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
                monitor_id: MonitorId(0),
                app_name: app.into(),
                window_title: String::new(),
                frame_hash: format!("f{}", secs),
                width: None,
                height: None,
            })
            .unwrap();
    }

    #[test]
    fn test_app_usage_counts_and_order() {
        let dir = TempDir::new().unwrap();
        let index = MetadataIndex::open(dir.path().join("recall.db")).unwrap();

        pending(&index, 1, "editor");
        pending(&index, 2, "Browser");
        pending(&index, 3, "Browser");
        pending(&index, 4, "");
        pending(&index, 5, "alpha");

        let usage = index.app_usage(None).unwrap();
        let names: Vec<&str> = usage.iter().map(|u| u.app_name.as_str()).collect();
        assert_eq!(names, vec!["Browser", "alpha", "editor"]);
        assert_eq!(usage[0].entries, 2);
        assert_eq!(usage[0].first_seen, Utc.timestamp_opt(2, 0).unwrap());
        assert_eq!(usage[0].last_seen, Utc.timestamp_opt(3, 0).unwrap());

        let range = TimeRange::new(
            Utc.timestamp_opt(3, 0).unwrap(),
            Utc.timestamp_opt(10, 0).unwrap(),
        )
        .unwrap();
        let usage = index.app_usage(Some(&range)).unwrap();
        assert_eq!(usage.len(), 2);
        assert!(usage.iter().all(|u| u.entries == 1));
    }
}
