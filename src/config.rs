//! Resolved configuration consumed by the core.
//!
//! The core components only ever receive these structs; reading `config.json`
//! from the data directory is the runner's job (`crate::run`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RecallError, Result};

pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    /// Contains the index database, frames and logs.
    pub data_dir: PathBuf,
    pub capture: CaptureConfig,
    pub dedup: DedupConfig,
    pub extraction: ExtractionConfig,
    pub search: SearchConfig,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            capture: CaptureConfig::default(),
            dedup: DedupConfig::default(),
            extraction: ExtractionConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("screenrecall")
}

// ==================== Capture ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorSelection {
    All,
    PrimaryOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameFormat {
    Png,
    Jpeg { quality: u8 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub interval_secs: u64,
    pub monitor_selection: MonitorSelection,
    /// Frames larger than this on their long side are downscaled before encoding.
    pub max_side: Option<u32>,
    pub frame_format: FrameFormat,
    /// Upper bound for a single monitor capture before it is abandoned.
    pub capture_timeout_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3,
            monitor_selection: MonitorSelection::All,
            max_side: Some(2560),
            frame_format: FrameFormat::Png,
            capture_timeout_secs: 10,
        }
    }
}

// ==================== Dedup ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMetric {
    Mssim,
    Dhash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub metric: DedupMetric,
    /// MSSIM at or above this value counts as "same frame".
    pub similarity_threshold: f64,
    /// dHash Hamming distance below this value counts as "same frame".
    pub dhash_threshold: u32,
    /// Images are downscaled to this long side before MSSIM comparison.
    pub compare_max_side: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            metric: DedupMetric::Mssim,
            similarity_threshold: 0.9,
            dhash_threshold: 10,
            compare_max_side: 512,
        }
    }
}

// ==================== Extraction ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OcrBackend {
    Tesseract {
        binary: String,
        language: String,
    },
    OllamaVision {
        url: String,
        model: String,
        prompt: String,
        timeout_secs: u64,
    },
    /// Try `primary` first; use `fallback` when it fails or reads nothing.
    WithFallback {
        primary: Box<OcrBackend>,
        fallback: Box<OcrBackend>,
    },
    Disabled,
}

impl Default for OcrBackend {
    fn default() -> Self {
        Self::Tesseract {
            binary: "tesseract".to_string(),
            language: "eng".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// Local feature-hashing embedder; no model download.
    Hashed,
    Ollama {
        url: String,
        model: String,
        timeout_secs: u64,
    },
}

impl Default for EmbeddingBackend {
    fn default() -> Self {
        Self::Hashed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub ocr: OcrBackend,
    pub embedding: EmbeddingBackend,
    pub embedding_dim: usize,
    pub clean_text: bool,
    /// Concurrent extraction jobs.
    pub workers: usize,
    /// Attempts to persist an extraction result before leaving the entry pending.
    pub finalize_attempts: u32,
    pub shutdown_grace_secs: u64,
    /// Rows read per batch when re-embedding stored text.
    pub rebuild_batch_size: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            ocr: OcrBackend::default(),
            embedding: EmbeddingBackend::default(),
            embedding_dim: 384,
            clean_text: true,
            workers: 2,
            finalize_attempts: 3,
            shutdown_grace_secs: 10,
            rebuild_batch_size: 200,
        }
    }
}

// ==================== Search ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub lexical_weight: f32,
    pub vector_weight: f32,
    /// Vector candidates below this cosine similarity are dropped.
    pub min_vector_similarity: f32,
    /// Each candidate fetch asks for `limit * candidate_multiplier` rows.
    pub candidate_multiplier: usize,
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            lexical_weight: 0.3,
            vector_weight: 0.7,
            min_vector_similarity: 0.3,
            candidate_multiplier: 5,
            default_limit: 50,
            max_limit: 1000,
        }
    }
}

// ==================== Load / Save ====================

impl RecallConfig {
    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(RecallError::Config(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| RecallError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write pretty JSON through a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| RecallError::Config(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.interval_secs == 0 {
            return Err(RecallError::Config("capture.interval_secs must be > 0".into()));
        }
        if let FrameFormat::Jpeg { quality } = self.capture.frame_format {
            if quality == 0 || quality > 100 {
                return Err(RecallError::Config(
                    "capture.frame_format.quality must be in 1..=100".into(),
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.dedup.similarity_threshold) {
            return Err(RecallError::Config(
                "dedup.similarity_threshold must be in [0, 1]".into(),
            ));
        }
        if self.dedup.compare_max_side < 8 {
            return Err(RecallError::Config("dedup.compare_max_side must be >= 8".into()));
        }
        if self.extraction.embedding_dim == 0 {
            return Err(RecallError::Config("extraction.embedding_dim must be > 0".into()));
        }
        if self.extraction.workers == 0 {
            return Err(RecallError::Config("extraction.workers must be > 0".into()));
        }
        let s = &self.search;
        if s.lexical_weight < 0.0 || s.vector_weight < 0.0 {
            return Err(RecallError::Config("search weights must be non-negative".into()));
        }
        if s.lexical_weight + s.vector_weight <= 0.0 {
            return Err(RecallError::Config("search weights must not both be zero".into()));
        }
        if s.candidate_multiplier == 0 || s.default_limit == 0 || s.max_limit == 0 {
            return Err(RecallError::Config(
                "search limits and candidate_multiplier must be > 0".into(),
            ));
        }
        if s.default_limit > s.max_limit {
            return Err(RecallError::Config(
                "search.default_limit must not exceed search.max_limit".into(),
            ));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("recall.db")
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.data_dir.join("frames")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use std::fs;

    #[test]
    fn test_defaults_are_valid() {
        RecallConfig::default().validate().unwrap();
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = RecallConfig::load_or_default(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config.capture.interval_secs, 3);
        assert_eq!(config.extraction.embedding_dim, 384);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"{ "capture": { "interval_secs": 7, "monitor_selection": "primary_only" },
                 "search": { "lexical_weight": 0.5 } }"#,
        )
        .unwrap();

        let config = RecallConfig::load_or_default(&path).unwrap();
        assert_eq!(config.capture.interval_secs, 7);
        assert_eq!(config.capture.monitor_selection, MonitorSelection::PrimaryOnly);
        assert_eq!(config.capture.frame_format, FrameFormat::Png);
        assert!((config.search.lexical_weight - 0.5).abs() < f32::EPSILON);
        assert!((config.search.vector_weight - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let mut config = RecallConfig::default();
        config.dedup.metric = DedupMetric::Dhash;
        config.extraction.ocr = OcrBackend::Disabled;
        config.save(&path).unwrap();

        let loaded = RecallConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded.dedup.metric, DedupMetric::Dhash);
        assert_eq!(loaded.extraction.ocr, OcrBackend::Disabled);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_loads_chained_ocr_backend() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"{ "extraction": { "ocr": {
                   "kind": "with_fallback",
                   "primary": { "kind": "ollama_vision", "url": "http://localhost:11434",
                                "model": "minicpm-v", "prompt": "Describe", "timeout_secs": 30 },
                   "fallback": { "kind": "tesseract", "binary": "tesseract", "language": "eng" } } } }"#,
        )
        .unwrap();

        let config = RecallConfig::load_or_default(&path).unwrap();
        match config.extraction.ocr {
            OcrBackend::WithFallback { primary, fallback } => {
                assert!(matches!(*primary, OcrBackend::OllamaVision { .. }));
                assert_eq!(*fallback, OcrBackend::default());
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = RecallConfig::default();
        config.capture.interval_secs = 0;
        assert!(matches!(config.validate(), Err(RecallError::Config(_))));

        let mut config = RecallConfig::default();
        config.search.lexical_weight = 0.0;
        config.search.vector_weight = 0.0;
        assert!(config.validate().is_err());

        let mut config = RecallConfig::default();
        config.dedup.similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
