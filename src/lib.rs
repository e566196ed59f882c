pub mod capture;
pub mod config;
pub mod dedup;
pub mod error;
pub mod extraction;
pub mod logging;
pub mod query;
pub mod recorder;
pub mod source;
pub mod storage;

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use config::{RecallConfig, CONFIG_FILE_NAME};
use recorder::Recorder;
use source::ScreenSource;

/// Overrides the data directory (config, database, frames, logs).
const DATA_DIR_ENV: &str = "SCREENRECALL_DATA_DIR";

fn get_data_dir() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(config::default_data_dir)
}

#[cfg(feature = "native-capture")]
fn screen_source() -> anyhow::Result<Arc<dyn ScreenSource>> {
    Ok(Arc::new(source::XcapSource::new()))
}

#[cfg(not(feature = "native-capture"))]
fn screen_source() -> anyhow::Result<Arc<dyn ScreenSource>> {
    anyhow::bail!("built without the `native-capture` feature; no screen source available")
}

/// Data dir, logging and configuration shared by every entry point.
fn prepare() -> anyhow::Result<(PathBuf, logging::DailyRotatingWriter, RecallConfig)> {
    let data_dir = get_data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;
    let log_writer = logging::init_logging(&data_dir);

    let mut config = RecallConfig::load_or_default(&data_dir.join(CONFIG_FILE_NAME))
        .context("Failed to load configuration")?;
    config.data_dir = data_dir.clone();
    Ok((data_dir, log_writer, config))
}

fn build_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}

/// Recompute every stored embedding with the configured embedding backend,
/// then exit. Run after changing the embedding model or dimension.
pub fn run_rebuild_embeddings() -> anyhow::Result<()> {
    let (_, _log_writer, config) = prepare()?;
    let runtime = build_runtime()?;

    runtime.block_on(async move {
        let extractor = Arc::new(
            extraction::Extractor::from_config(&config.extraction)
                .context("Failed to build extraction backends")?,
        );
        let index = storage::MetadataIndex::open(config.db_path())
            .context("Failed to open index")?;
        let batch = config.extraction.rebuild_batch_size;
        let report = tokio::task::spawn_blocking(move || {
            let report = extraction::rebuild_embeddings(&extractor, &index, batch);
            let closed = index.shutdown();
            report.and_then(|r| closed.map(|_| r))
        })
        .await
        .context("Re-embedding worker failed")?
        .context("Re-embedding failed")?;

        println!(
            "Re-embedded {} of {} entries ({} without text, {} failed)",
            report.updated, report.scanned, report.skipped, report.failed
        );
        Ok(())
    })
}

/// Record until Ctrl-C.
pub fn run() -> anyhow::Result<()> {
    let (data_dir, _log_writer, config) = prepare()?;
    let runtime = build_runtime()?;

    runtime.block_on(async move {
        let cancel = CancellationToken::new();
        let maintenance = logging::spawn_maintenance_task(data_dir.clone(), cancel.clone());

        let source = screen_source()?;
        let recorder = Recorder::open(config, source).context("Failed to start recorder")?;
        match recorder.stats() {
            Ok(stats) => tracing::info!(
                "Index ready: {} entries ({} pending) in {}",
                stats.total_entries,
                stats.pending_entries,
                data_dir.display()
            ),
            Err(e) => tracing::warn!("Failed to read index stats: {}", e),
        }

        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, stopping");
            }
            signal_cancel.cancel();
        });

        let result = recorder.run(cancel.clone()).await;
        cancel.cancel();
        let _ = maintenance.await;

        let status = recorder.status();
        tracing::info!(
            "Session ended: {} ticks, {} accepted, {} rejected, {} capture failures, {} storage failures, {} busy skips",
            status.ticks,
            status.accepted,
            status.rejected,
            status.capture_failures,
            status.storage_failures,
            status.busy_skips
        );
        result.context("Shutdown failed")
    })
}
