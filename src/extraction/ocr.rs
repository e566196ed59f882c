//! Text recognition backends.

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageFormat};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RecallError, Result};

/// Turns a frame into text. Implementations run on extraction workers and
/// may block.
pub trait TextRecognizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn recognize(&self, image: &DynamicImage) -> Result<String>;
}

/// Always yields empty text.
pub struct DisabledRecognizer;

impl TextRecognizer for DisabledRecognizer {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn recognize(&self, _image: &DynamicImage) -> Result<String> {
        Ok(String::new())
    }
}

/// Chains two recognizers: `fallback` runs when `primary` errors or
/// returns only whitespace.
pub struct FallbackRecognizer {
    primary: Arc<dyn TextRecognizer>,
    fallback: Arc<dyn TextRecognizer>,
}

impl FallbackRecognizer {
    pub fn new(primary: Arc<dyn TextRecognizer>, fallback: Arc<dyn TextRecognizer>) -> Self {
        Self { primary, fallback }
    }
}

impl TextRecognizer for FallbackRecognizer {
    fn name(&self) -> &'static str {
        "with_fallback"
    }

    fn recognize(&self, image: &DynamicImage) -> Result<String> {
        match self.primary.recognize(image) {
            Ok(text) if !text.trim().is_empty() => return Ok(text),
            Ok(_) => tracing::debug!(
                "{} read nothing, trying {}",
                self.primary.name(),
                self.fallback.name()
            ),
            Err(e) => tracing::warn!(
                "{} failed, trying {}: {}",
                self.primary.name(),
                self.fallback.name(),
                e
            ),
        }
        self.fallback.recognize(image)
    }
}

// ==================== Tesseract ====================

/// Runs the `tesseract` CLI, feeding a PNG on stdin and reading text from stdout.
pub struct TesseractRecognizer {
    binary: String,
    language: String,
}

impl TesseractRecognizer {
    pub fn new(binary: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            language: language.into(),
        }
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    fn recognize(&self, image: &DynamicImage) -> Result<String> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| RecallError::Extraction(format!("Failed to encode OCR input: {}", e)))?;

        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", &self.language])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RecallError::Extraction(format!("Failed to start {}: {}", self.binary, e))
            })?;

        // Feed stdin from a separate thread so a chatty stderr cannot deadlock us.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecallError::Extraction("tesseract stdin unavailable".into()))?;
        let writer = std::thread::spawn(move || stdin.write_all(&png));

        let output = child
            .wait_with_output()
            .map_err(|e| RecallError::Extraction(format!("tesseract did not finish: {}", e)))?;
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(RecallError::Extraction(format!(
                    "Failed to send image to tesseract: {}",
                    e
                )))
            }
            Err(_) => return Err(RecallError::Extraction("tesseract writer panicked".into())),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RecallError::Extraction(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

// ==================== Ollama vision ====================

/// Vision models get at most this many pixels on the long side.
const VISION_MAX_SIDE: u32 = 1024;
const VISION_JPEG_QUALITY: u8 = 85;

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Asks a local vision model (Ollama `/api/generate`) to describe the frame;
/// the description becomes the entry's text.
pub struct OllamaVisionRecognizer {
    url: String,
    model: String,
    prompt: String,
    timeout: Duration,
    client: OnceCell<reqwest::blocking::Client>,
}

impl OllamaVisionRecognizer {
    pub fn new(url: &str, model: &str, prompt: &str, timeout_secs: u64) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            prompt: prompt.to_string(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
            client: OnceCell::new(),
        }
    }

    // Built lazily on a worker thread; the blocking client must not be
    // created from inside the async runtime.
    fn client(&self) -> Result<&reqwest::blocking::Client> {
        self.client.get_or_try_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| RecallError::Extraction(format!("Failed to build HTTP client: {}", e)))
        })
    }

    fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>> {
        let (w, h) = image.dimensions();
        let resized;
        let source = if w.max(h) > VISION_MAX_SIDE {
            resized = image.resize(
                VISION_MAX_SIDE,
                VISION_MAX_SIDE,
                image::imageops::FilterType::Lanczos3,
            );
            &resized
        } else {
            image
        };
        let rgb = source.to_rgb8();
        let mut jpeg_buf = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg_buf, VISION_JPEG_QUALITY)
            .encode_image(&rgb)
            .map_err(|e| RecallError::Extraction(format!("JPEG encoding failed: {}", e)))?;
        Ok(jpeg_buf)
    }
}

impl TextRecognizer for OllamaVisionRecognizer {
    fn name(&self) -> &'static str {
        "ollama_vision"
    }

    fn recognize(&self, image: &DynamicImage) -> Result<String> {
        let jpeg = Self::encode_jpeg(image)?;
        let request = GenerateRequest {
            model: &self.model,
            prompt: &self.prompt,
            images: vec![base64::engine::general_purpose::STANDARD.encode(&jpeg)],
            stream: false,
        };

        let response = self
            .client()?
            .post(format!("{}/api/generate", self.url))
            .json(&request)
            .send()
            .map_err(|e| RecallError::Extraction(format!("Vision request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(RecallError::Extraction(format!(
                "Vision model returned HTTP {}",
                response.status()
            )));
        }
        let body: GenerateResponse = response
            .json()
            .map_err(|e| RecallError::Extraction(format!("Invalid vision response: {}", e)))?;
        Ok(body.response.trim().to_string())
    }
}
