//! Extraction stage: OCR and embedding over accepted frames.
//!
//! Extraction never fails as a whole. A recognizer error yields empty text,
//! and an embedder error (or a vector of the wrong length) yields no
//! embedding. Both halves can be called on their own.

mod embedding;
mod ocr;
mod pool;
mod rebuild;
mod text;

pub use embedding::{Embedder, HashedEmbedder, OllamaEmbedder};
pub use ocr::{
    DisabledRecognizer, FallbackRecognizer, OllamaVisionRecognizer, TesseractRecognizer,
    TextRecognizer,
};
pub use pool::{ExtractionJob, ExtractionPool, PoolStats};
pub use rebuild::{rebuild_embeddings, RebuildReport};
pub use text::{clean_ocr_text, tokenize};

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{EmbeddingBackend, ExtractionConfig, OcrBackend};
use crate::error::{RecallError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

pub struct Extractor {
    recognizer: Arc<dyn TextRecognizer>,
    embedder: Arc<dyn Embedder>,
    embedding_dim: usize,
    clean_text: bool,
}

fn build_recognizer(backend: &OcrBackend) -> Arc<dyn TextRecognizer> {
    match backend {
        OcrBackend::Tesseract { binary, language } => {
            Arc::new(TesseractRecognizer::new(binary.clone(), language.clone()))
        }
        OcrBackend::OllamaVision {
            url,
            model,
            prompt,
            timeout_secs,
        } => Arc::new(OllamaVisionRecognizer::new(url, model, prompt, *timeout_secs)),
        OcrBackend::WithFallback { primary, fallback } => Arc::new(FallbackRecognizer::new(
            build_recognizer(primary),
            build_recognizer(fallback),
        )),
        OcrBackend::Disabled => Arc::new(DisabledRecognizer),
    }
}

impl Extractor {
    /// Fails when `embedding_dim` is zero or the embedder produces vectors
    /// of another dimension.
    pub fn new(
        recognizer: Arc<dyn TextRecognizer>,
        embedder: Arc<dyn Embedder>,
        embedding_dim: usize,
        clean_text: bool,
    ) -> Result<Self> {
        if embedding_dim == 0 {
            return Err(RecallError::Config("embedding_dim must be positive".into()));
        }
        if embedder.dim() != embedding_dim {
            return Err(RecallError::Config(format!(
                "embedder {} produces {} dims, configured embedding_dim is {}",
                embedder.name(),
                embedder.dim(),
                embedding_dim
            )));
        }
        Ok(Self {
            recognizer,
            embedder,
            embedding_dim,
            clean_text,
        })
    }

    /// Build the configured backends.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self> {
        let recognizer = build_recognizer(&config.ocr);
        let embedder: Arc<dyn Embedder> = match &config.embedding {
            EmbeddingBackend::Hashed => Arc::new(HashedEmbedder::new(config.embedding_dim)),
            EmbeddingBackend::Ollama {
                url,
                model,
                timeout_secs,
            } => Arc::new(OllamaEmbedder::new(
                url,
                model,
                config.embedding_dim,
                *timeout_secs,
            )),
        };
        tracing::info!(
            "Extraction backends: ocr={}, embedding={} ({} dims)",
            recognizer.name(),
            embedder.name(),
            config.embedding_dim
        );
        Self::new(recognizer, embedder, config.embedding_dim, config.clean_text)
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// OCR text for `image`; empty on recognizer failure.
    pub fn recognize_text(&self, image: &DynamicImage) -> String {
        let started = std::time::Instant::now();
        match self.recognizer.recognize(image) {
            Ok(raw) => {
                let text = if self.clean_text {
                    clean_ocr_text(&raw)
                } else {
                    raw.trim().to_string()
                };
                tracing::debug!(
                    "OCR ({}) produced {} chars in {:?}",
                    self.recognizer.name(),
                    text.chars().count(),
                    started.elapsed()
                );
                text
            }
            Err(e) => {
                tracing::warn!("OCR ({}) failed: {}", self.recognizer.name(), e);
                String::new()
            }
        }
    }

    /// Embedding of `text`, validated against the configured dimension.
    pub fn try_embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(RecallError::Extraction("nothing to embed".into()));
        }
        let vector = self.embedder.embed(text)?;
        if vector.len() != self.embedding_dim {
            return Err(RecallError::Extraction(format!(
                "{} returned {} dims, expected {}",
                self.embedder.name(),
                vector.len(),
                self.embedding_dim
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(RecallError::Extraction(format!(
                "{} returned non-finite values",
                self.embedder.name()
            )));
        }
        Ok(vector)
    }

    /// Embedding of `text`; `None` for empty text or any embedder failure.
    pub fn embed_text(&self, text: &str) -> Option<Vec<f32>> {
        if text.trim().is_empty() {
            return None;
        }
        match self.try_embed(text) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Embedding failed: {}", e);
                None
            }
        }
    }

    pub fn extract(&self, image: &DynamicImage) -> ExtractionResult {
        let text = self.recognize_text(image);
        let embedding = self.embed_text(&text);
        ExtractionResult { text, embedding }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable backends shared by unit and pipeline tests.
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns fixed text, or an error when `text` is `None`.
    pub struct FixedRecognizer {
        pub text: Option<String>,
        pub calls: AtomicUsize,
    }

    impl FixedRecognizer {
        pub fn new(text: Option<&str>) -> Self {
            Self {
                text: text.map(str::to_string),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TextRecognizer for FixedRecognizer {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn recognize(&self, _image: &DynamicImage) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.text
                .clone()
                .ok_or_else(|| RecallError::Extraction("engine crashed".into()))
        }
    }

    /// Declares `dim` but produces vectors of length `len`.
    pub struct ConstantEmbedder {
        pub dim: usize,
        pub len: usize,
    }

    impl Embedder for ConstantEmbedder {
        fn name(&self) -> &'static str {
            "constant"
        }

        fn dim(&self) -> usize {
            self.dim
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0; self.len])
        }
    }
}
