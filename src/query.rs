//! Hybrid query engine: lexical match and vector similarity, merged per entry.
//!
//! score = lexical_weight * (lexical / max_lexical) + vector_weight * max(cosine, 0)
//!
//! Vector candidates under `min_vector_similarity` are dropped before merging.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SearchConfig;
use crate::error::{RecallError, Result};
use crate::extraction::Extractor;
use crate::storage::{Entry, EntryId, FrameStore, MetadataIndex, TimeRange, MAX_RESULT_LIMIT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub entry: Entry,
    pub score: f32,
    /// Normalized to [0, 1] against the best lexical candidate.
    pub lexical_score: f32,
    /// Cosine similarity clamped at 0; 0 when the entry was not a vector candidate.
    pub vector_score: f32,
}

pub struct QueryEngine {
    index: Arc<MetadataIndex>,
    frames: Arc<FrameStore>,
    extractor: Arc<Extractor>,
    config: SearchConfig,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RecallError::storage(format!("query worker join failed: {}", e)))?
}

impl QueryEngine {
    pub fn new(
        index: Arc<MetadataIndex>,
        frames: Arc<FrameStore>,
        extractor: Arc<Extractor>,
        config: SearchConfig,
    ) -> Self {
        Self {
            index,
            frames,
            extractor,
            config,
        }
    }

    /// `limit` or the configured default, checked against the maximum.
    fn resolve_limit(&self, limit: Option<usize>) -> Result<usize> {
        let limit = limit.unwrap_or(self.config.default_limit);
        let max = self.config.max_limit.min(MAX_RESULT_LIMIT);
        if limit == 0 || limit > max {
            return Err(RecallError::invalid_query(format!(
                "limit must be between 1 and {}, got {}",
                max, limit
            )));
        }
        Ok(limit)
    }

    /// Ranked entries for `query`. A blank query lists entries newest first.
    /// Without a `limit` the configured default applies.
    pub async fn search(
        &self,
        query: &str,
        range: Option<TimeRange>,
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>> {
        let limit = self.resolve_limit(limit)?;
        if let Some(r) = &range {
            r.validate()?;
        }

        if query.trim().is_empty() {
            let entries = self.timeline(range.unwrap_or_else(TimeRange::all), Some(limit)).await?;
            return Ok(entries
                .into_iter()
                .map(|entry| SearchHit {
                    entry,
                    score: 0.0,
                    lexical_score: 0.0,
                    vector_score: 0.0,
                })
                .collect());
        }

        let search_start = std::time::Instant::now();
        let candidates = limit
            .saturating_mul(self.config.candidate_multiplier.max(1))
            .min(MAX_RESULT_LIMIT);

        let embedding = {
            let extractor = Arc::clone(&self.extractor);
            let text = query.to_string();
            match blocking(move || extractor.try_embed(&text)).await {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("Query embedding unavailable, lexical ranking only: {}", e);
                    None
                }
            }
        };

        let lexical_fut = {
            let index = Arc::clone(&self.index);
            let text = query.to_string();
            blocking(move || index.search_text(&text, candidates, range.as_ref()))
        };
        let vector_fut = {
            let index = Arc::clone(&self.index);
            async move {
                match embedding {
                    Some(v) => blocking(move || index.search_vector(&v, candidates, range.as_ref())).await,
                    None => Ok(Vec::new()),
                }
            }
        };
        let (lexical, vector) = tokio::join!(lexical_fut, vector_fut);
        let (lexical, vector) = (lexical?, vector?);

        let lexical_count = lexical.len();
        let vector_count = vector.len();
        let hits = self.merge(lexical, vector, limit);

        tracing::debug!(
            "search '{}': {} lexical + {} vector candidates -> {} hits in {:?}",
            query,
            lexical_count,
            vector_count,
            hits.len(),
            search_start.elapsed()
        );
        Ok(hits)
    }

    fn merge(
        &self,
        lexical: Vec<(Entry, f32)>,
        vector: Vec<(Entry, f32)>,
        limit: usize,
    ) -> Vec<SearchHit> {
        let max_lexical = lexical.iter().map(|(_, s)| *s).fold(0.0f32, f32::max);
        let mut merged: HashMap<EntryId, SearchHit> = HashMap::new();

        for (entry, raw) in lexical {
            let lexical_score = if max_lexical > 0.0 { raw / max_lexical } else { 0.0 };
            merged.insert(
                entry.id,
                SearchHit {
                    entry,
                    score: 0.0,
                    lexical_score,
                    vector_score: 0.0,
                },
            );
        }

        for (entry, cosine) in vector {
            if cosine < self.config.min_vector_similarity {
                continue;
            }
            let vector_score = cosine.max(0.0);
            merged
                .entry(entry.id)
                .and_modify(|hit| hit.vector_score = vector_score)
                .or_insert(SearchHit {
                    entry,
                    score: 0.0,
                    lexical_score: 0.0,
                    vector_score,
                });
        }

        let mut hits: Vec<SearchHit> = merged
            .into_values()
            .map(|mut hit| {
                hit.score = self.config.lexical_weight * hit.lexical_score
                    + self.config.vector_weight * hit.vector_score;
                hit
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.entry.timestamp.cmp(&a.entry.timestamp))
                .then(b.entry.id.cmp(&a.entry.id))
        });
        hits.truncate(limit);
        hits
    }

    /// Newest-first entries in `range`.
    pub async fn timeline(&self, range: TimeRange, limit: Option<usize>) -> Result<Vec<Entry>> {
        let limit = self.resolve_limit(limit)?;
        let index = Arc::clone(&self.index);
        blocking(move || index.query_by_time_limited(&range, Some(limit))).await
    }

    pub async fn get_entry(&self, id: EntryId) -> Result<Option<Entry>> {
        let index = Arc::clone(&self.index);
        blocking(move || index.get_entry(id)).await
    }

    /// Encoded bytes of the frame behind `entry`.
    pub async fn frame_for(&self, entry: &Entry) -> Result<Vec<u8>> {
        let frames = Arc::clone(&self.frames);
        let hash = entry.frame_hash.clone();
        blocking(move || frames.get(&hash)).await
    }
}
