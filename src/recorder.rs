//! Wiring of the pipeline: storage, extraction pool, deduplicator, capture
//! scheduler and query engine built from one [`RecallConfig`].

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureScheduler, CaptureState, CaptureStatus};
use crate::config::RecallConfig;
use crate::dedup::Deduplicator;
use crate::error::{RecallError, Result};
use crate::extraction::{rebuild_embeddings, ExtractionPool, Extractor, RebuildReport};
use crate::query::QueryEngine;
use crate::source::ScreenSource;
use crate::storage::{FrameStore, IndexStats, MetadataIndex};

pub struct Recorder {
    config: RecallConfig,
    index: Arc<MetadataIndex>,
    extractor: Arc<Extractor>,
    pool: Arc<ExtractionPool>,
    scheduler: CaptureScheduler,
    query: QueryEngine,
}

impl Recorder {
    /// Open storage, clean up after an interrupted run and queue pending
    /// entries for extraction. Must be called inside a tokio runtime.
    pub fn open(config: RecallConfig, source: Arc<dyn ScreenSource>) -> Result<Self> {
        let extractor = Arc::new(Extractor::from_config(&config.extraction)?);
        Self::with_extractor(config, source, extractor)
    }

    /// Same as [`Recorder::open`] with caller-supplied extraction backends.
    pub fn with_extractor(
        config: RecallConfig,
        source: Arc<dyn ScreenSource>,
        extractor: Arc<Extractor>,
    ) -> Result<Self> {
        config.validate()?;
        if extractor.embedding_dim() != config.extraction.embedding_dim {
            return Err(RecallError::Config(format!(
                "extractor produces {} dims, configured embedding_dim is {}",
                extractor.embedding_dim(),
                config.extraction.embedding_dim
            )));
        }
        std::fs::create_dir_all(&config.data_dir)?;

        let index = Arc::new(MetadataIndex::open(config.db_path())?);
        let frames = Arc::new(FrameStore::open(config.frames_dir())?);
        frames.reconcile(&index.referenced_frames()?)?;

        let pool = Arc::new(ExtractionPool::new(
            Arc::clone(&extractor),
            Arc::clone(&index),
            Arc::clone(&frames),
            config.extraction.workers,
            config.extraction.finalize_attempts,
        ));
        pool.recover_pending()?;

        let dedup = Arc::new(Deduplicator::new(&config.dedup));
        let scheduler = CaptureScheduler::new(
            config.capture.clone(),
            source,
            dedup,
            Arc::clone(&frames),
            Arc::clone(&index),
            Arc::clone(&pool),
        );
        let query = QueryEngine::new(
            Arc::clone(&index),
            frames,
            Arc::clone(&extractor),
            config.search.clone(),
        );

        Ok(Self {
            config,
            index,
            extractor,
            pool,
            scheduler,
            query,
        })
    }

    pub fn scheduler(&self) -> &CaptureScheduler {
        &self.scheduler
    }

    pub fn query(&self) -> &QueryEngine {
        &self.query
    }

    pub fn index(&self) -> &Arc<MetadataIndex> {
        &self.index
    }

    pub fn state(&self) -> Arc<CaptureState> {
        self.scheduler.state()
    }

    pub fn status(&self) -> CaptureStatus {
        self.scheduler.status()
    }

    pub fn stats(&self) -> Result<IndexStats> {
        self.index.stats()
    }

    /// Recompute stored embeddings with the current embedding backend.
    pub async fn rebuild_embeddings(&self) -> Result<RebuildReport> {
        let extractor = Arc::clone(&self.extractor);
        let index = Arc::clone(&self.index);
        let batch = self.config.extraction.rebuild_batch_size;
        tokio::task::spawn_blocking(move || rebuild_embeddings(&extractor, &index, batch))
            .await
            .map_err(|e| RecallError::storage(format!("rebuild worker join failed: {}", e)))?
    }

    /// Capture until `cancel` fires, then drain extraction and close the index.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.scheduler.run(cancel).await;
        self.shutdown().await
    }

    /// Drain in-flight extraction within the configured grace period and
    /// close the database. Unfinished entries stay pending.
    pub async fn shutdown(&self) -> Result<()> {
        let grace = Duration::from_secs(self.config.extraction.shutdown_grace_secs);
        self.pool.drain(grace).await;
        let stats = self.pool.stats();
        tracing::info!(
            "Extraction drained: {} finalized, {} failed, {} in flight",
            stats.finalized,
            stats.failed,
            stats.in_flight
        );
        self.index.shutdown()
    }
}
