//! Re-embedding of stored entry text, for use after the embedding backend or
//! its dimension changes. Entries with a stale vector are otherwise skipped
//! by vector search.

use serde::{Deserialize, Serialize};

use super::Extractor;
use crate::error::Result;
use crate::storage::{EntryId, MetadataIndex};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub scanned: usize,
    pub updated: usize,
    /// Entries without text.
    pub skipped: usize,
    /// Entries the embedder could not handle; their old vector is kept.
    pub failed: usize,
}

/// Recompute the embedding of every finalized entry from its stored text,
/// `batch_size` rows at a time. Embedder failures are counted and skipped;
/// storage errors abort the run.
pub fn rebuild_embeddings(
    extractor: &Extractor,
    index: &MetadataIndex,
    batch_size: usize,
) -> Result<RebuildReport> {
    let started = std::time::Instant::now();
    let batch_size = batch_size.max(1);
    let mut report = RebuildReport::default();
    let mut last_id: EntryId = 0;

    loop {
        let batch = index.finalized_texts_after(last_id, batch_size)?;
        if batch.is_empty() {
            break;
        }
        for (id, text) in batch {
            last_id = id;
            report.scanned += 1;
            if text.trim().is_empty() {
                report.skipped += 1;
                continue;
            }
            match extractor.try_embed(&text) {
                Ok(vector) => {
                    if index.update_embedding(id, Some(&vector))? {
                        report.updated += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("Re-embedding entry {} failed: {}", id, e);
                }
            }
        }
        tracing::info!(
            "Re-embedding: {} scanned, {} updated so far",
            report.scanned,
            report.updated
        );
    }

    tracing::info!(
        "Re-embedding finished in {:?}: {} updated, {} without text, {} failed",
        started.elapsed(),
        report.updated,
        report.skipped,
        report.failed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::testing::{ConstantEmbedder, FixedRecognizer};
    use crate::extraction::HashedEmbedder;
    use crate::storage::{EntryMeta, MonitorId, NewEntry, TimeRange};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn add(index: &MetadataIndex, secs: i64, text: &str, embedding: Option<Vec<f32>>) -> EntryId {
        index
            .insert(&NewEntry {
                meta: EntryMeta {
                    timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
                    monitor_id: MonitorId(1),
                    app_name: "Editor".into(),
                    window_title: String::new(),
                    frame_hash: format!("frame-{}", secs),
                    width: None,
                    height: None,
                },
                text: text.to_string(),
                embedding,
            })
            .unwrap()
    }

    fn extractor(dim: usize) -> Extractor {
        Extractor::new(
            Arc::new(FixedRecognizer::new(Some(""))),
            Arc::new(HashedEmbedder::new(dim)),
            dim,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_rebuild_replaces_old_dimension_vectors() {
        let dir = TempDir::new().unwrap();
        let index = MetadataIndex::open(dir.path().join("recall.db")).unwrap();
        let ids: Vec<EntryId> = (0..5)
            .map(|i| add(&index, 10 + i, "quarterly invoice summary", Some(vec![1.0, 0.0])))
            .collect();
        let blank = add(&index, 20, "", None);
        let pending = index
            .insert_pending(&EntryMeta {
                timestamp: Utc.timestamp_opt(30, 0).unwrap(),
                monitor_id: MonitorId(1),
                app_name: String::new(),
                window_title: String::new(),
                frame_hash: "frame-30".into(),
                width: None,
                height: None,
            })
            .unwrap();

        let new_model = extractor(8);
        let query = new_model.try_embed("invoice").unwrap();
        assert!(index.search_vector(&query, 10, None).unwrap().is_empty());

        let report = rebuild_embeddings(&new_model, &index, 2).unwrap();
        assert_eq!(
            report,
            RebuildReport {
                scanned: 6,
                updated: 5,
                skipped: 1,
                failed: 0,
            }
        );

        let hits = index.search_vector(&query, 10, None).unwrap();
        assert_eq!(hits.len(), 5);
        for (entry, _) in &hits {
            assert!(ids.contains(&entry.id));
            assert_eq!(entry.embedding.as_ref().map(Vec::len), Some(8));
        }
        assert_eq!(index.get_entry(blank).unwrap().unwrap().embedding, None);
        assert_eq!(index.get_entry(pending).unwrap().unwrap().embedding, None);
        assert_eq!(index.query_by_time(&TimeRange::all()).unwrap().len(), 7);
    }

    #[test]
    fn test_rebuild_keeps_vector_when_embedder_fails() {
        let dir = TempDir::new().unwrap();
        let index = MetadataIndex::open(dir.path().join("recall.db")).unwrap();
        let id = add(&index, 10, "meeting notes", Some(vec![0.5, 0.5, 0.5, 0.5]));

        let broken = Extractor::new(
            Arc::new(FixedRecognizer::new(Some(""))),
            Arc::new(ConstantEmbedder { dim: 4, len: 3 }),
            4,
            true,
        )
        .unwrap();
        let report = rebuild_embeddings(&broken, &index, 10).unwrap();
        assert_eq!((report.scanned, report.updated, report.failed), (1, 0, 1));
        assert_eq!(
            index.get_entry(id).unwrap().unwrap().embedding,
            Some(vec![0.5, 0.5, 0.5, 0.5])
        );
    }
}
