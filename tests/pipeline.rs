//! End-to-end runs of the recorder against a scripted screen.

use image::{DynamicImage, Rgb, RgbImage};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use screenrecall_lib::capture::MonitorOutcome;
use screenrecall_lib::config::{ExtractionConfig, RecallConfig};
use screenrecall_lib::error::{RecallError, Result};
use screenrecall_lib::extraction::{Embedder, Extractor, TextRecognizer};
use screenrecall_lib::recorder::Recorder;
use screenrecall_lib::source::{MonitorInfo, ScreenSource, WindowInfo};
use screenrecall_lib::storage::{EntryMeta, EntryStatus, MonitorId, TimeRange};

const DESKTOP: Rgb<u8> = Rgb([90, 120, 160]);
const BROKEN: Rgb<u8> = Rgb([255, 0, 0]);

/// One monitor showing a queue of frames; the last frame stays on screen.
struct ScriptedScreen {
    frames: Mutex<VecDeque<(DynamicImage, WindowInfo)>>,
}

impl ScriptedScreen {
    fn new(frames: Vec<(DynamicImage, &str, &str)>) -> Self {
        Self {
            frames: Mutex::new(
                frames
                    .into_iter()
                    .map(|(img, app, title)| {
                        (
                            img,
                            WindowInfo {
                                app_name: app.to_string(),
                                title: title.to_string(),
                            },
                        )
                    })
                    .collect(),
            ),
        }
    }

    fn current(&self) -> Option<(DynamicImage, WindowInfo)> {
        self.frames.lock().unwrap().front().cloned()
    }
}

impl ScreenSource for ScriptedScreen {
    fn monitors(&self) -> Result<Vec<MonitorInfo>> {
        Ok(vec![MonitorInfo {
            id: MonitorId(1),
            name: "built-in".into(),
            width: 96,
            height: 64,
            is_primary: true,
        }])
    }

    fn capture(&self, _monitor: MonitorId) -> Result<DynamicImage> {
        let mut frames = self.frames.lock().unwrap();
        let frame = frames
            .front()
            .map(|(img, _)| img.clone())
            .ok_or_else(|| RecallError::Capture("screen off".into()))?;
        if frames.len() > 1 {
            frames.pop_front();
        }
        Ok(frame)
    }

    fn active_window(&self) -> Option<WindowInfo> {
        self.current().map(|(_, window)| window)
    }
}

/// Reads the desktop color as an empty desktop, red as an engine crash and
/// anything else as an open invoice.
struct ColorKeyedRecognizer;

impl TextRecognizer for ColorKeyedRecognizer {
    fn name(&self) -> &'static str {
        "color-keyed"
    }

    fn recognize(&self, image: &DynamicImage) -> Result<String> {
        match *image.to_rgb8().get_pixel(0, 0) {
            p if p == DESKTOP => Ok("Recycle Bin  Documents  Downloads".into()),
            p if p == BROKEN => Err(RecallError::Extraction("engine crashed".into())),
            _ => Ok("Invoice 2024 payment due Friday".into()),
        }
    }
}

/// Two axes: "mentions invoice" and "everything else".
struct KeywordEmbedder;

impl Embedder for KeywordEmbedder {
    fn name(&self) -> &'static str {
        "keyword"
    }

    fn dim(&self) -> usize {
        2
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.to_lowercase().contains("invoice") {
            Ok(vec![1.0, 0.1])
        } else {
            Ok(vec![0.0, 1.0])
        }
    }
}

fn desktop() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(96, 64, DESKTOP))
}

fn invoice_window() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(96, 64, |x, y| {
        if y < 8 || (x / 6) % 2 == 0 {
            Rgb([250, 250, 250])
        } else {
            Rgb([20, 20, 20])
        }
    }))
}

fn crashing_frame() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(96, 64, |x, y| {
        if (x, y) == (0, 0) || (y / 8) % 2 == 0 {
            BROKEN
        } else {
            Rgb([0, 0, 0])
        }
    }))
}

fn open_recorder(dir: &TempDir, screen: ScriptedScreen) -> Recorder {
    let config = RecallConfig {
        data_dir: dir.path().to_path_buf(),
        extraction: ExtractionConfig {
            embedding_dim: 2,
            ..ExtractionConfig::default()
        },
        ..RecallConfig::default()
    };
    let extractor = Arc::new(Extractor::new(
        Arc::new(ColorKeyedRecognizer),
        Arc::new(KeywordEmbedder),
        2,
        true,
    ).unwrap());
    Recorder::with_extractor(config, Arc::new(screen), extractor).unwrap()
}

/// Wait until every accepted frame has been extracted.
async fn settle(recorder: &Recorder) {
    for _ in 0..200 {
        let stats = recorder.stats().unwrap();
        if stats.pending_entries == 0 && recorder.status().extraction.in_flight == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("extraction did not settle");
}

#[tokio::test]
async fn test_invoice_scenario() {
    let dir = TempDir::new().unwrap();
    let screen = ScriptedScreen::new(vec![
        (desktop(), "Finder", "Desktop"),
        (desktop(), "Finder", "Desktop"),
        (invoice_window(), "Preview", "invoice-2024.pdf"),
    ]);
    let recorder = open_recorder(&dir, screen);
    let scheduler = recorder.scheduler();

    let first = scheduler.tick().await.accepted();
    assert_eq!(first.len(), 1);
    let second = scheduler.tick().await;
    assert_eq!(second.outcomes, vec![(MonitorId(1), MonitorOutcome::Rejected)]);
    let third = scheduler.tick().await.accepted();
    assert_eq!(third.len(), 1);
    settle(&recorder).await;

    let (entry0, entry1) = (first[0], third[0]);
    let hits = recorder.query().search("invoice", None, Some(10)).await.unwrap();
    let ids: Vec<_> = hits.iter().map(|h| h.entry.id).collect();
    assert_eq!(ids, vec![entry1]);
    assert!(hits[0].lexical_score > 0.0);
    assert!(hits[0].vector_score > 0.9);
    assert_eq!(hits[0].entry.app_name, "Preview");
    assert_eq!(hits[0].entry.window_title, "invoice-2024.pdf");
    assert_eq!(hits[0].entry.status, EntryStatus::Finalized);

    let timeline = recorder.query().timeline(TimeRange::all(), None).await.unwrap();
    let timeline_ids: Vec<_> = timeline.iter().map(|e| e.id).collect();
    assert_eq!(timeline_ids, vec![entry1, entry0]);

    let blank = recorder.query().search("  ", None, None).await.unwrap();
    let blank_ids: Vec<_> = blank.iter().map(|h| h.entry.id).collect();
    assert_eq!(blank_ids, timeline_ids);

    let frame = recorder.query().frame_for(&hits[0].entry).await.unwrap();
    assert_eq!(
        image::load_from_memory(&frame).unwrap().to_rgb8(),
        invoice_window().to_rgb8()
    );

    let status = recorder.status();
    assert_eq!((status.ticks, status.accepted, status.rejected), (3, 2, 1));
    recorder.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ocr_failure_keeps_entry_in_timeline() {
    let dir = TempDir::new().unwrap();
    let screen = ScriptedScreen::new(vec![(crashing_frame(), "Terminal", "build")]);
    let recorder = open_recorder(&dir, screen);

    let accepted = recorder.scheduler().tick().await.accepted();
    assert_eq!(accepted.len(), 1);
    settle(&recorder).await;

    let entry = recorder
        .query()
        .get_entry(accepted[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.text, "");
    assert_eq!(entry.embedding, None);
    assert_eq!(entry.status, EntryStatus::Finalized);

    let index = recorder.index();
    assert!(index.search_text("invoice", 10, None).unwrap().is_empty());
    assert!(index.search_vector(&[1.0, 0.1], 10, None).unwrap().is_empty());
    let all = index.query_by_time(&TimeRange::all()).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, accepted[0]);
    recorder.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_recovers_pending_and_keeps_entries() {
    let dir = TempDir::new().unwrap();

    let first_run = open_recorder(&dir, ScriptedScreen::new(vec![(invoice_window(), "Preview", "a.pdf")]));
    let accepted = first_run.scheduler().tick().await.accepted();
    settle(&first_run).await;
    let frame_hash = first_run
        .index()
        .get_entry(accepted[0])
        .unwrap()
        .unwrap()
        .frame_hash;

    // An entry whose extraction was interrupted by a crash.
    let pending = first_run
        .index()
        .insert_pending(&EntryMeta {
            timestamp: chrono::Utc::now(),
            monitor_id: MonitorId(2),
            app_name: "Preview".into(),
            window_title: "b.pdf".into(),
            frame_hash: frame_hash.clone(),
            width: Some(96),
            height: Some(64),
        })
        .unwrap();
    first_run.index().shutdown().unwrap();
    drop(first_run);

    let second_run = open_recorder(&dir, ScriptedScreen::new(vec![(desktop(), "Finder", "Desktop")]));
    settle(&second_run).await;

    let recovered = second_run.index().get_entry(pending).unwrap().unwrap();
    assert_eq!(recovered.status, EntryStatus::Finalized);
    assert!(recovered.text.contains("Invoice"));

    let hits = second_run.query().search("invoice", None, Some(10)).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.entry.frame_hash == frame_hash));
    second_run.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rebuild_restores_vector_search_after_model_change() {
    let dir = TempDir::new().unwrap();
    let recorder = open_recorder(&dir, ScriptedScreen::new(vec![(invoice_window(), "Preview", "a.pdf")]));
    let accepted = recorder.scheduler().tick().await.accepted();
    settle(&recorder).await;

    // Vectors written by a previous three-dimensional model.
    let index = recorder.index();
    assert!(index.update_embedding(accepted[0], Some(&[0.2, 0.2, 0.9])).unwrap());
    assert!(index.search_vector(&[1.0, 0.1], 10, None).unwrap().is_empty());

    let report = recorder.rebuild_embeddings().await.unwrap();
    assert_eq!((report.scanned, report.updated, report.failed), (1, 1, 0));

    let hits = recorder.query().search("invoice", None, Some(10)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].vector_score > 0.9);
    recorder.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_extractor_dimension_must_match_config() {
    let dir = TempDir::new().unwrap();
    let config = RecallConfig {
        data_dir: dir.path().to_path_buf(),
        ..RecallConfig::default()
    };
    let extractor = Arc::new(
        Extractor::new(Arc::new(ColorKeyedRecognizer), Arc::new(KeywordEmbedder), 2, true).unwrap(),
    );
    let screen = Arc::new(ScriptedScreen::new(vec![(desktop(), "Finder", "Desktop")]));
    assert!(matches!(
        Recorder::with_extractor(config, screen, extractor),
        Err(RecallError::Config(_))
    ));
}
