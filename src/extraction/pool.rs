//! Bounded worker pool that extracts accepted frames and finalizes their entries.

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use super::{ExtractionResult, Extractor};
use crate::error::{RecallError, Result};
use crate::storage::{EntryId, FrameStore, MetadataIndex};

/// Recovery re-queues at most this many pending entries per startup.
const MAX_RECOVERED: usize = 10_000;

const FINALIZE_BACKOFF: Duration = Duration::from_millis(200);

/// One accepted frame awaiting extraction. Without `image` the frame is
/// decoded from the frame store.
#[derive(Clone)]
pub struct ExtractionJob {
    pub entry_id: EntryId,
    pub frame_hash: String,
    pub image: Option<Arc<DynamicImage>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub dispatched: u64,
    pub finalized: u64,
    /// Jobs whose result could not be persisted; their entries stay pending.
    pub failed: u64,
    pub in_flight: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    finalized: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
}

pub struct ExtractionPool {
    extractor: Arc<Extractor>,
    index: Arc<MetadataIndex>,
    frames: Arc<FrameStore>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    finalize_attempts: u32,
    counters: Arc<Counters>,
}

impl ExtractionPool {
    pub fn new(
        extractor: Arc<Extractor>,
        index: Arc<MetadataIndex>,
        frames: Arc<FrameStore>,
        workers: usize,
        finalize_attempts: u32,
    ) -> Self {
        Self {
            extractor,
            index,
            frames,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tracker: TaskTracker::new(),
            finalize_attempts: finalize_attempts.max(1),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            finalized: self.counters.finalized.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Queue a job. Returns false once the pool is closed; the entry then
    /// stays pending until the next startup recovers it.
    pub fn dispatch(&self, job: ExtractionJob) -> bool {
        if self.tracker.is_closed() {
            tracing::warn!(
                "Extraction pool closed, entry {} left pending",
                job.entry_id
            );
            return false;
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);

        let permits = Arc::clone(&self.permits);
        let extractor = Arc::clone(&self.extractor);
        let index = Arc::clone(&self.index);
        let frames = Arc::clone(&self.frames);
        let counters = Arc::clone(&self.counters);
        let attempts = self.finalize_attempts;

        self.tracker.spawn(async move {
            let entry_id = job.entry_id;
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => tokio::task::spawn_blocking(move || {
                    process_job(&extractor, &index, &frames, job, attempts)
                })
                .await
                .map_err(|e| RecallError::Extraction(format!("extraction worker join failed: {}", e)))
                .and_then(|r| r),
                Err(_) => Err(RecallError::Extraction("extraction pool shut down".into())),
            };

            match outcome {
                Ok(()) => {
                    counters.finalized.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        "Extraction for entry {} failed, left pending: {}",
                        entry_id,
                        e
                    );
                }
            }
            counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        });
        true
    }

    /// Re-queue every pending entry whose frame is still on disk.
    pub fn recover_pending(&self) -> Result<usize> {
        let pending = self.index.pending_entries(MAX_RECOVERED)?;
        let mut queued = 0;
        for entry in pending {
            if !self.frames.contains(&entry.frame_hash) {
                tracing::warn!(
                    "Pending entry {} references missing frame {}, skipping",
                    entry.id,
                    entry.frame_hash
                );
                continue;
            }
            if self.dispatch(ExtractionJob {
                entry_id: entry.id,
                frame_hash: entry.frame_hash,
                image: None,
            }) {
                queued += 1;
            }
        }
        if queued > 0 {
            tracing::info!("Recovered {} pending entries for extraction", queued);
        }
        Ok(queued)
    }

    /// Stop accepting jobs and wait up to `grace` for running ones.
    /// Returns true when everything finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        let remaining = self.tracker.len();
        if remaining > 0 {
            tracing::info!("Waiting up to {:?} for {} extraction jobs", grace, remaining);
        }
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    "{} extraction jobs still running at shutdown; their entries stay pending",
                    self.tracker.len()
                );
                false
            }
        }
    }
}

/// Extract and persist one job. Runs on a blocking thread.
fn process_job(
    extractor: &Extractor,
    index: &MetadataIndex,
    frames: &FrameStore,
    job: ExtractionJob,
    attempts: u32,
) -> Result<()> {
    let started = std::time::Instant::now();
    let result = match job.image {
        Some(image) => extractor.extract(&image),
        None => match load_frame(frames, &job.frame_hash) {
            Ok(image) => extractor.extract(&image),
            Err(e) => {
                // Unreadable frame: finalize with nothing rather than retry forever.
                tracing::warn!(
                    "Frame {} for entry {} unreadable: {}",
                    job.frame_hash,
                    job.entry_id,
                    e
                );
                ExtractionResult::default()
            }
        },
    };

    finalize_with_retry(index, job.entry_id, &result, attempts)?;
    tracing::debug!(
        "Entry {} finalized ({} chars, embedding={}) in {:?}",
        job.entry_id,
        result.text.chars().count(),
        result.embedding.is_some(),
        started.elapsed()
    );
    Ok(())
}

fn load_frame(frames: &FrameStore, hash: &str) -> Result<DynamicImage> {
    let bytes = frames.get(hash)?;
    image::load_from_memory(&bytes)
        .map_err(|e| RecallError::Extraction(format!("Failed to decode frame: {}", e)))
}

fn finalize_with_retry(
    index: &MetadataIndex,
    entry_id: EntryId,
    result: &ExtractionResult,
    attempts: u32,
) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=attempts {
        match index.finalize(entry_id, &result.text, result.embedding.as_deref()) {
            Ok(changed) => {
                if !changed {
                    tracing::debug!("Entry {} was already finalized", entry_id);
                }
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(
                    "Finalize attempt {}/{} for entry {} failed: {}",
                    attempt,
                    attempts,
                    entry_id,
                    e
                );
                last_err = Some(e);
                if attempt < attempts {
                    std::thread::sleep(FINALIZE_BACKOFF * attempt);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| RecallError::storage("finalize not attempted")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::testing::FixedRecognizer;
    use crate::extraction::HashedEmbedder;
    use crate::storage::{EntryMeta, EntryStatus, MonitorId};
    use chrono::Utc;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        index: Arc<MetadataIndex>,
        frames: Arc<FrameStore>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(MetadataIndex::open(dir.path().join("recall.db")).unwrap());
        let frames = Arc::new(FrameStore::open(dir.path().join("frames")).unwrap());
        Fixture {
            _dir: dir,
            index,
            frames,
        }
    }

    fn pool(f: &Fixture, text: Option<&str>) -> ExtractionPool {
        let extractor = Arc::new(Extractor::new(
            Arc::new(FixedRecognizer::new(text)),
            Arc::new(HashedEmbedder::new(16)),
            16,
            false,
        ).unwrap());
        ExtractionPool::new(extractor, f.index.clone(), f.frames.clone(), 2, 2)
    }

    fn stored_frame(f: &Fixture) -> String {
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(8, 8))
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();
        f.frames.put(&png).unwrap()
    }

    fn pending(f: &Fixture, hash: &str, secs: i64) -> EntryId {
        f.index
            .insert_pending(&EntryMeta {
                timestamp: Utc::now() + chrono::Duration::seconds(secs),
                monitor_id: MonitorId(1),
                app_name: String::new(),
                window_title: String::new(),
                frame_hash: hash.to_string(),
                width: Some(8),
                height: Some(8),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_finalizes_entry() {
        let f = fixture();
        let pool = pool(&f, Some("quarterly invoice"));
        let hash = stored_frame(&f);
        let id = pending(&f, &hash, 0);

        let image = Arc::new(DynamicImage::ImageRgb8(RgbImage::new(8, 8)));
        assert!(pool.dispatch(ExtractionJob {
            entry_id: id,
            frame_hash: hash,
            image: Some(image),
        }));
        assert!(pool.drain(Duration::from_secs(10)).await);

        let entry = f.index.get_entry(id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Finalized);
        assert_eq!(entry.text, "quarterly invoice");
        assert_eq!(entry.embedding.map(|e| e.len()), Some(16));
        assert_eq!(pool.stats().finalized, 1);
        assert_eq!(pool.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_recover_pending_loads_frame_from_store() {
        let f = fixture();
        let hash = stored_frame(&f);
        let id = pending(&f, &hash, 0);
        let missing = pending(&f, &FrameStore::compute_hash(b"gone"), 1);

        let pool = pool(&f, Some("recovered text"));
        assert_eq!(pool.recover_pending().unwrap(), 1);
        assert!(pool.drain(Duration::from_secs(10)).await);

        assert_eq!(f.index.get_entry(id).unwrap().unwrap().text, "recovered text");
        assert_eq!(
            f.index.get_entry(missing).unwrap().unwrap().status,
            EntryStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_ocr_failure_still_finalizes_with_empty_text() {
        let f = fixture();
        let pool = pool(&f, None);
        let hash = stored_frame(&f);
        let id = pending(&f, &hash, 0);

        pool.dispatch(ExtractionJob {
            entry_id: id,
            frame_hash: hash,
            image: None,
        });
        assert!(pool.drain(Duration::from_secs(10)).await);

        let entry = f.index.get_entry(id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Finalized);
        assert!(entry.text.is_empty());
        assert!(entry.embedding.is_none());
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_jobs() {
        let f = fixture();
        let pool = pool(&f, Some("x"));
        assert!(pool.drain(Duration::from_millis(10)).await);
        assert!(!pool.dispatch(ExtractionJob {
            entry_id: 1,
            frame_hash: String::new(),
            image: None,
        }));
    }

    #[tokio::test]
    async fn test_finalize_failure_counts_as_failed() {
        let f = fixture();
        let pool = pool(&f, Some("text"));
        // No such entry: finalize errors on every attempt.
        pool.dispatch(ExtractionJob {
            entry_id: 999,
            frame_hash: String::new(),
            image: Some(Arc::new(DynamicImage::ImageRgb8(RgbImage::new(2, 2)))),
        });
        assert!(pool.drain(Duration::from_secs(10)).await);
        assert_eq!(pool.stats().failed, 1);
    }
}
