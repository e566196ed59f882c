use chrono::{DateTime, Utc};
use futures::future::join_all;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{CaptureConfig, FrameFormat};
use crate::dedup::Deduplicator;
use crate::error::{RecallError, Result};
use crate::extraction::{ExtractionJob, ExtractionPool, PoolStats};
use crate::source::{select_monitors, MonitorInfo, ScreenSource, WindowInfo};
use crate::storage::{EntryId, EntryMeta, FrameStore, MetadataIndex, MonitorId};

// ==================== Frame Encoding ====================

pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// The image exactly as stored (after downscaling).
    pub image: DynamicImage,
}

/// Downscale to `max_side` if needed, then encode in `format`.
pub fn encode_frame(
    image: DynamicImage,
    format: FrameFormat,
    max_side: Option<u32>,
) -> Result<EncodedFrame> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Err(RecallError::Capture("empty frame".into()));
    }

    let mut dynamic = image;
    if let Some(max_side) = max_side.filter(|&m| m > 0) {
        let max_dim = w.max(h);
        if max_dim > max_side {
            let ratio = max_side as f64 / max_dim as f64;
            let new_w = ((w as f64 * ratio) as u32).max(1);
            let new_h = ((h as f64 * ratio) as u32).max(1);
            dynamic = dynamic.resize_exact(new_w, new_h, image::imageops::FilterType::Lanczos3);
        }
    }
    let (final_w, final_h) = dynamic.dimensions();

    let mut buf = Vec::new();
    match format {
        FrameFormat::Png => {
            dynamic
                .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
                .map_err(|e| RecallError::storage(format!("PNG encoding failed: {}", e)))?;
        }
        FrameFormat::Jpeg { quality } => {
            // JPEG has no alpha channel.
            let rgb = dynamic.to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
                .encode_image(&rgb)
                .map_err(|e| RecallError::storage(format!("JPEG encoding failed: {}", e)))?;
        }
    }

    Ok(EncodedFrame {
        bytes: buf,
        width: final_w,
        height: final_h,
        image: dynamic,
    })
}

// ==================== Capture State ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub paused: bool,
    pub session_start: DateTime<Utc>,
    pub ticks: u64,
    pub captures: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub capture_failures: u64,
    pub storage_failures: u64,
    /// Monitors skipped because their previous capture had not returned.
    pub busy_skips: u64,
    pub extraction: PoolStats,
}

/// Shared, lock-free recorder state: the pause switch plus counters.
pub struct CaptureState {
    paused: AtomicBool,
    session_start: DateTime<Utc>,
    ticks: AtomicU64,
    captures: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    capture_failures: AtomicU64,
    storage_failures: AtomicU64,
    busy_skips: AtomicU64,
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureState {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            session_start: Utc::now(),
            ticks: AtomicU64::new(0),
            captures: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            storage_failures: AtomicU64::new(0),
            busy_skips: AtomicU64::new(0),
        }
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::info!("Capture paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("Capture resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn snapshot(&self, extraction: PoolStats) -> CaptureStatus {
        CaptureStatus {
            paused: self.is_paused(),
            session_start: self.session_start,
            ticks: self.ticks.load(Ordering::Relaxed),
            captures: self.captures.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            busy_skips: self.busy_skips.load(Ordering::Relaxed),
            extraction,
        }
    }
}

// ==================== Scheduler ====================

/// What happened to one monitor during one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    Accepted { entry_id: EntryId, frame_hash: String },
    Rejected,
    CaptureFailed,
    StorageFailed,
    /// The previous capture of this monitor is still running.
    Busy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub outcomes: Vec<(MonitorId, MonitorOutcome)>,
}

impl TickReport {
    pub fn accepted(&self) -> Vec<EntryId> {
        self.outcomes
            .iter()
            .filter_map(|(_, o)| match o {
                MonitorOutcome::Accepted { entry_id, .. } => Some(*entry_id),
                _ => None,
            })
            .collect()
    }
}

struct Accepted {
    entry_id: EntryId,
    frame_hash: String,
    image: Arc<DynamicImage>,
}

/// Marks a monitor as having a capture in progress until dropped. Dropped
/// by the blocking capture itself, so a capture abandoned by a timeout
/// keeps its monitor busy until the platform call returns.
struct InFlightGuard {
    busy: Arc<Mutex<HashSet<MonitorId>>>,
    monitor: MonitorId,
}

impl InFlightGuard {
    fn acquire(busy: &Arc<Mutex<HashSet<MonitorId>>>, monitor: MonitorId) -> Option<Self> {
        let inserted = busy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(monitor);
        inserted.then(|| Self {
            busy: Arc::clone(busy),
            monitor,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.monitor);
    }
}

pub struct CaptureScheduler {
    config: CaptureConfig,
    source: Arc<dyn ScreenSource>,
    dedup: Arc<Deduplicator>,
    frames: Arc<FrameStore>,
    index: Arc<MetadataIndex>,
    pool: Arc<ExtractionPool>,
    state: Arc<CaptureState>,
    in_flight: Arc<Mutex<HashSet<MonitorId>>>,
}

impl CaptureScheduler {
    pub fn new(
        config: CaptureConfig,
        source: Arc<dyn ScreenSource>,
        dedup: Arc<Deduplicator>,
        frames: Arc<FrameStore>,
        index: Arc<MetadataIndex>,
        pool: Arc<ExtractionPool>,
    ) -> Self {
        Self {
            config,
            source,
            dedup,
            frames,
            index,
            pool,
            state: Arc::new(CaptureState::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn state(&self) -> Arc<CaptureState> {
        Arc::clone(&self.state)
    }

    pub fn status(&self) -> CaptureStatus {
        self.state.snapshot(self.pool.stats())
    }

    /// Tick until `cancel` fires. Cancellation is observed between ticks only.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            "Capture loop started (interval {}s, {:?})",
            self.config.interval_secs,
            self.config.monitor_selection
        );

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Capture loop: stop signal received");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        tracing::info!("Capture loop ended");
    }

    /// One iteration: capture every monitor in scope concurrently and wait for all.
    pub async fn tick(&self) -> TickReport {
        if self.state.is_paused() {
            return TickReport::default();
        }
        self.state.ticks.fetch_add(1, Ordering::Relaxed);

        let source = Arc::clone(&self.source);
        let selection = self.config.monitor_selection;
        let discovered = tokio::task::spawn_blocking(move || {
            let monitors = source.monitors().map(|m| select_monitors(m, selection));
            (monitors, source.active_window().unwrap_or_default())
        })
        .await;

        let (monitors, window) = match discovered {
            Ok((Ok(monitors), window)) => (monitors, window),
            Ok((Err(e), _)) => {
                self.state.capture_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Monitor enumeration failed: {}", e);
                return TickReport::default();
            }
            Err(e) => {
                self.state.capture_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Monitor enumeration worker join failed: {}", e);
                return TickReport::default();
            }
        };

        let timestamp = Utc::now();
        let futures = monitors
            .into_iter()
            .map(|m| self.capture_monitor(m, window.clone(), timestamp));
        let outcomes = join_all(futures).await;
        TickReport { outcomes }
    }

    async fn capture_monitor(
        &self,
        monitor: MonitorInfo,
        window: WindowInfo,
        timestamp: DateTime<Utc>,
    ) -> (MonitorId, MonitorOutcome) {
        let monitor_id = monitor.id;
        let source = Arc::clone(&self.source);
        let dedup = Arc::clone(&self.dedup);
        let frames = Arc::clone(&self.frames);
        let index = Arc::clone(&self.index);
        let format = self.config.frame_format;
        let max_side = self.config.max_side;
        let capture_start = std::time::Instant::now();

        let guard = match InFlightGuard::acquire(&self.in_flight, monitor_id) {
            Some(guard) => guard,
            None => {
                self.state.busy_skips.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("[{}] Previous capture still running, skipped", monitor_id);
                return (monitor_id, MonitorOutcome::Busy);
            }
        };

        // Only the platform call is bounded; an abandoned capture still holds
        // the guard and its frame is dropped unseen by dedup and storage.
        let grab = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            source.capture(monitor_id)
        });
        let timeout = Duration::from_secs(self.config.capture_timeout_secs.max(1));
        let captured = match tokio::time::timeout(timeout, grab).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => Err(RecallError::Capture(format!("capture worker join failed: {}", e))),
            Err(_) => Err(RecallError::Capture(format!(
                "capture timeout (> {}s)",
                timeout.as_secs()
            ))),
        };

        let result = match captured {
            Ok(image) => {
                let store = tokio::task::spawn_blocking(move || -> Result<Option<Accepted>> {
                    if !dedup.accept(monitor_id, &image) {
                        return Ok(None);
                    }
                    let stored = store_frame(&frames, &index, image, format, max_side, &window, monitor_id, timestamp);
                    if stored.is_err() {
                        // Let the next tick retry this monitor.
                        dedup.forget(monitor_id);
                    }
                    stored.map(Some)
                });
                match store.await {
                    Ok(r) => r,
                    Err(e) => Err(RecallError::storage(format!("store worker join failed: {}", e))),
                }
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(Some(accepted)) => {
                self.state.captures.fetch_add(1, Ordering::Relaxed);
                self.state.accepted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "[{}] Accepted frame {} as entry {} in {:?}",
                    monitor_id,
                    short_hash(&accepted.frame_hash),
                    accepted.entry_id,
                    capture_start.elapsed()
                );
                self.pool.dispatch(ExtractionJob {
                    entry_id: accepted.entry_id,
                    frame_hash: accepted.frame_hash.clone(),
                    image: Some(accepted.image),
                });
                MonitorOutcome::Accepted {
                    entry_id: accepted.entry_id,
                    frame_hash: accepted.frame_hash,
                }
            }
            Ok(None) => {
                self.state.captures.fetch_add(1, Ordering::Relaxed);
                self.state.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("[{}] Frame unchanged, skipped", monitor_id);
                MonitorOutcome::Rejected
            }
            Err(e) if e.is_storage() => {
                self.state.captures.fetch_add(1, Ordering::Relaxed);
                self.state.storage_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("[{}] Failed to store frame: {}", monitor_id, e);
                MonitorOutcome::StorageFailed
            }
            Err(e) => {
                self.state.capture_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("[{}] Capture failed: {}", monitor_id, e);
                MonitorOutcome::CaptureFailed
            }
        };
        (monitor_id, outcome)
    }
}

/// Log-friendly hash prefix.
fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Frame first (fsync + rename), then the pending entry that references it.
#[allow(clippy::too_many_arguments)]
fn store_frame(
    frames: &FrameStore,
    index: &MetadataIndex,
    image: DynamicImage,
    format: FrameFormat,
    max_side: Option<u32>,
    window: &WindowInfo,
    monitor_id: MonitorId,
    timestamp: DateTime<Utc>,
) -> Result<Accepted> {
    let encoded = encode_frame(image, format, max_side)?;
    let frame_hash = frames.put(&encoded.bytes)?;
    let entry_id = index.insert_pending(&EntryMeta {
        timestamp,
        monitor_id,
        app_name: window.app_name.clone(),
        window_title: window.title.clone(),
        frame_hash: frame_hash.clone(),
        width: Some(encoded.width),
        height: Some(encoded.height),
    })?;
    Ok(Accepted {
        entry_id,
        frame_hash,
        image: Arc::new(encoded.image),
    })
}
