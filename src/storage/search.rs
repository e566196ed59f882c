//! Text search over the bigram bitmap index, and brute-force vector search.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};

use super::types::{deserialize_embedding, EntryRow, ENTRY_COLUMNS};
use super::{Entry, EntryId, MetadataIndex, TimeRange};
use crate::error::{RecallError, Result};

/// Upper bound on `limit` accepted by the index itself.
pub const MAX_RESULT_LIMIT: usize = 10_000;

/// Occurrence count at which a fully covered entry reaches score 1.0.
const SATURATING_OCCURRENCES: f32 = 10.0;

const ID_CHUNK: usize = 500;

/// Cosine similarity; 0.0 for mismatched lengths or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Whitespace-split, lowercased, deduplicated keywords in query order.
pub(crate) fn query_keywords(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split_whitespace()
        .map(|kw| kw.to_lowercase())
        .filter(|kw| seen.insert(kw.clone()))
        .collect()
}

/// Coverage-weighted occurrence score in [0, 1]; 0.0 when no keyword occurs.
pub(crate) fn lexical_score(keywords: &[String], lowered_text: &str) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let mut matched = 0usize;
    let mut occurrences = 0usize;
    for kw in keywords {
        let count = lowered_text.matches(kw.as_str()).count();
        if count > 0 {
            matched += 1;
            occurrences += count;
        }
    }
    if matched == 0 {
        return 0.0;
    }
    let coverage = matched as f32 / keywords.len() as f32;
    let score =
        coverage * (1.0 + (occurrences as f32).ln_1p()) / (1.0 + SATURATING_OCCURRENCES.ln_1p());
    score.min(1.0)
}

fn check_limit(limit: usize) -> Result<()> {
    if limit == 0 || limit > MAX_RESULT_LIMIT {
        return Err(RecallError::invalid_query(format!(
            "limit must be between 1 and {}, got {}",
            MAX_RESULT_LIMIT, limit
        )));
    }
    Ok(())
}

/// Score desc, then newest first, then id desc.
fn rank(scored: &mut [(EntryId, i64, f32)]) {
    scored.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.1.cmp(&a.1))
            .then(b.0.cmp(&a.0))
    });
}

impl MetadataIndex {
    /// Lowercased character bigrams, skipping any that contain whitespace.
    pub(super) fn bigram_tokenize(text: &str) -> HashSet<String> {
        let chars: Vec<char> = text.to_lowercase().chars().collect();
        if chars.len() < 2 {
            return HashSet::new();
        }
        chars
            .windows(2)
            .filter(|w| !w[0].is_whitespace() && !w[1].is_whitespace())
            .map(|w| w.iter().collect())
            .collect()
    }

    /// Add `id` to the posting bitmap of every bigram in `text`.
    pub(super) fn index_text(conn: &Connection, id: EntryId, text: &str) -> Result<()> {
        let tokens = Self::bigram_tokenize(text);
        if tokens.is_empty() {
            return Ok(());
        }
        let doc_id = u32::try_from(id)
            .map_err(|_| RecallError::storage(format!("Entry id {} exceeds bitmap range", id)))?;

        let mut get_stmt = conn
            .prepare_cached("SELECT postings_blob FROM bigram_index WHERE token = ?1")
            .map_err(|e| RecallError::storage(format!("Failed to prepare get statement: {}", e)))?;
        let mut put_stmt = conn
            .prepare_cached("INSERT OR REPLACE INTO bigram_index (token, postings_blob) VALUES (?1, ?2)")
            .map_err(|e| RecallError::storage(format!("Failed to prepare put statement: {}", e)))?;

        for token in tokens {
            let existing_blob: Option<Vec<u8>> = get_stmt
                .query_row(params![&token], |row| row.get(0))
                .optional()
                .map_err(|e| RecallError::storage(format!("Failed to query postings: {}", e)))?;
            let mut bitmap = match existing_blob {
                Some(blob) => roaring::RoaringBitmap::deserialize_from(&blob[..])
                    .map_err(|e| RecallError::storage(format!("Failed to deserialize bitmap: {}", e)))?,
                None => roaring::RoaringBitmap::new(),
            };
            bitmap.insert(doc_id);

            let mut serialized_blob = Vec::with_capacity(bitmap.serialized_size());
            bitmap
                .serialize_into(&mut serialized_blob)
                .map_err(|e| RecallError::storage(format!("Failed to serialize bitmap: {}", e)))?;
            put_stmt
                .execute(params![&token, &serialized_blob])
                .map_err(|e| RecallError::storage(format!("Failed to update bigram index: {}", e)))?;
        }
        Ok(())
    }

    /// Entries whose bitmap contains every bigram of `keyword`.
    fn keyword_candidates(conn: &Connection, keyword: &str) -> Result<roaring::RoaringBitmap> {
        let mut result: Option<roaring::RoaringBitmap> = None;
        let mut stmt = conn
            .prepare_cached("SELECT postings_blob FROM bigram_index WHERE token = ?")
            .map_err(|e| RecallError::storage(format!("Failed to prepare bitmap query: {}", e)))?;

        for token in Self::bigram_tokenize(keyword) {
            let blob: Option<Vec<u8>> = stmt
                .query_row(params![&token], |row| row.get(0))
                .optional()
                .map_err(|e| RecallError::storage(format!("Failed to query bitmap: {}", e)))?;
            let Some(blob) = blob else {
                return Ok(roaring::RoaringBitmap::new());
            };
            let bitmap = roaring::RoaringBitmap::deserialize_from(&blob[..])
                .map_err(|e| RecallError::storage(format!("Failed to deserialize bitmap: {}", e)))?;
            result = Some(match result {
                Some(acc) => acc & bitmap,
                None => bitmap,
            });
            if result.as_ref().map(|b| b.is_empty()).unwrap_or(false) {
                break;
            }
        }
        Ok(result.unwrap_or_default())
    }

    /// Case-insensitive substring search. An entry matches when any keyword
    /// occurs in its text; ranking is by `lexical_score`.
    pub fn search_text(
        &self,
        query: &str,
        limit: usize,
        range: Option<&TimeRange>,
    ) -> Result<Vec<(Entry, f32)>> {
        check_limit(limit)?;
        let range = range.copied().unwrap_or_else(TimeRange::all);
        range.validate()?;
        let keywords = query_keywords(query);
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let diag_start = std::time::Instant::now();
        let (start_ms, end_ms) = range.bounds_ms();
        let needs_scan = keywords.iter().any(|kw| kw.chars().count() < 2);

        let (rows, scanned) = self.with_reader(|conn| {
            // (id, timestamp_ms, text) of every candidate in range
            let mut candidates: Vec<(EntryId, i64, String)> = Vec::new();
            if needs_scan {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT id, timestamp_ms, text FROM entries
                         WHERE timestamp_ms BETWEEN ? AND ? AND text != ''",
                    )
                    .map_err(|e| RecallError::storage(format!("Failed to prepare scan: {}", e)))?;
                let rows = stmt
                    .query_map(params![start_ms, end_ms], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })
                    .map_err(|e| RecallError::storage(format!("Failed to scan entries: {}", e)))?;
                for row in rows
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| RecallError::storage(format!("Failed to read entry text: {}", e)))?
                {
                    candidates.push(row);
                }
            } else {
                let mut union = roaring::RoaringBitmap::new();
                for kw in &keywords {
                    union |= Self::keyword_candidates(conn, kw)?;
                }
                let ids: Vec<i64> = union.iter().map(|v| v as i64).collect();
                for chunk in ids.chunks(ID_CHUNK) {
                    let placeholders = chunk.iter().map(|_| "?").collect::<Vec<&str>>().join(",");
                    let sql = format!(
                        "SELECT id, timestamp_ms, text FROM entries
                         WHERE id IN ({}) AND timestamp_ms BETWEEN ? AND ?",
                        placeholders
                    );
                    let mut sql_params: Vec<&dyn rusqlite::ToSql> =
                        chunk.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
                    sql_params.push(&start_ms);
                    sql_params.push(&end_ms);
                    let mut stmt = conn.prepare(&sql).map_err(|e| {
                        RecallError::storage(format!("Failed to prepare candidate fetch: {}", e))
                    })?;
                    let rows = stmt
                        .query_map(sql_params.as_slice(), |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                        })
                        .map_err(|e| {
                            RecallError::storage(format!("Failed to fetch candidates: {}", e))
                        })?;
                    for row in rows
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| RecallError::storage(format!("Failed to read entry text: {}", e)))?
                {
                        candidates.push(row);
                    }
                }
            }
            let scanned = candidates.len();

            let mut scored: Vec<(EntryId, i64, f32)> = candidates
                .into_iter()
                .filter_map(|(id, ts, text)| {
                    let score = lexical_score(&keywords, &text.to_lowercase());
                    (score > 0.0).then_some((id, ts, score))
                })
                .collect();
            rank(&mut scored);
            scored.truncate(limit);

            let mut rows = Self::fetch_rows(conn, scored.iter().map(|s| s.0))?;
            let ranked: Vec<(EntryRow, f32)> = scored
                .into_iter()
                .filter_map(|(id, _, score)| rows.remove(&id).map(|row| (row, score)))
                .collect();
            Ok((ranked, scanned))
        })?;

        if diag_start.elapsed().as_secs() >= 2 {
            tracing::warn!(
                "[DIAG:SEARCH] search_text '{}' scanned {} candidates in {:?}",
                query,
                scanned,
                diag_start.elapsed()
            );
        }

        Ok(rows
            .into_iter()
            .map(|(row, score)| (row.into_entry(), score))
            .collect())
    }

    /// Cosine-ranked entries. Entries without an embedding, or whose
    /// embedding length differs from the query, never appear.
    pub fn search_vector(
        &self,
        embedding: &[f32],
        limit: usize,
        range: Option<&TimeRange>,
    ) -> Result<Vec<(Entry, f32)>> {
        check_limit(limit)?;
        if embedding.is_empty() {
            return Err(RecallError::invalid_query("query embedding is empty"));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(RecallError::invalid_query(
                "query embedding contains non-finite values",
            ));
        }
        let range = range.copied().unwrap_or_else(TimeRange::all);
        range.validate()?;
        let (start_ms, end_ms) = range.bounds_ms();

        let diag_start = std::time::Instant::now();
        let mut skipped_dims = 0usize;

        let ranked: Vec<(EntryRow, f32)> = self.with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT id, timestamp_ms, embedding FROM entries
                     WHERE embedding IS NOT NULL AND timestamp_ms BETWEEN ? AND ?",
                )
                .map_err(|e| RecallError::storage(format!("Failed to prepare vector scan: {}", e)))?;
            let rows = stmt
                .query_map(params![start_ms, end_ms], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })
                .map_err(|e| RecallError::storage(format!("Failed to scan embeddings: {}", e)))?;

            let mut scored: Vec<(EntryId, i64, f32)> = Vec::new();
            for (id, ts, blob) in rows
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| RecallError::storage(format!("Failed to read embedding row: {}", e)))?
            {
                match deserialize_embedding(&blob) {
                    Some(stored) if stored.len() == embedding.len() => {
                        scored.push((id, ts, cosine_similarity(embedding, &stored)));
                    }
                    _ => skipped_dims += 1,
                }
            }
            rank(&mut scored);
            scored.truncate(limit);

            let mut rows = Self::fetch_rows(conn, scored.iter().map(|s| s.0))?;
            Ok(scored
                .into_iter()
                .filter_map(|(id, _, score)| rows.remove(&id).map(|row| (row, score)))
                .collect())
        })?;

        if skipped_dims > 0 {
            tracing::debug!(
                "search_vector skipped {} entries with mismatched embedding dimension",
                skipped_dims
            );
        }
        if diag_start.elapsed().as_secs() >= 2 {
            tracing::warn!(
                "[DIAG:SEARCH] search_vector over {} dims took {:?}",
                embedding.len(),
                diag_start.elapsed()
            );
        }

        Ok(ranked
            .into_iter()
            .map(|(row, score)| (row.into_entry(), score))
            .collect())
    }

    /// Full rows for `ids`, fetched in chunks.
    fn fetch_rows(
        conn: &Connection,
        ids: impl Iterator<Item = EntryId>,
    ) -> Result<HashMap<EntryId, EntryRow>> {
        let ids: Vec<EntryId> = ids.collect();
        let mut rows = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = chunk.iter().map(|_| "?").collect::<Vec<&str>>().join(",");
            let sql = format!(
                "SELECT {} FROM entries WHERE id IN ({})",
                ENTRY_COLUMNS, placeholders
            );
            let sql_params: Vec<&dyn rusqlite::ToSql> =
                chunk.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| RecallError::storage(format!("Failed to prepare row fetch: {}", e)))?;
            let fetched = stmt
                .query_map(sql_params.as_slice(), EntryRow::from_row)
                .map_err(|e| RecallError::storage(format!("Failed to fetch rows: {}", e)))?;
            for row in fetched
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| RecallError::storage(format!("Failed to read entry row: {}", e)))?
            {
                rows.insert(row.id, row);
            }
        }
        Ok(rows)
    }
}
