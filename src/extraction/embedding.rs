//! Text embedding backends.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

use super::text::tokenize;
use crate::error::{RecallError, Result};

/// Maps text to a fixed-length vector. Implementations may block.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Length of the vectors this backend produces.
    fn dim(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

// ==================== Feature hashing ====================

/// Local embedder: each token is hashed to a signed bucket, weighted by
/// sublinear term frequency, and the vector is L2-normalized. Texts sharing
/// vocabulary land close together; no model download is needed.
pub struct HashedEmbedder {
    dim: usize,
}

impl HashedEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(head) % self.dim as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }
}

impl Embedder for HashedEmbedder {
    fn name(&self) -> &'static str {
        "hashed"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for token in tokenize(text) {
            *counts.entry(token).or_insert(0) += 1;
        }
        if counts.is_empty() {
            return Err(RecallError::Extraction("text has no indexable tokens".into()));
        }

        let mut vector = vec![0.0f32; self.dim];
        for (token, count) in counts {
            let (index, sign) = self.bucket(&token);
            vector[index] += sign * (1.0 + (count as f32).ln());
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }
}

// ==================== Ollama ====================

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Calls Ollama's `/api/embeddings`.
pub struct OllamaEmbedder {
    url: String,
    model: String,
    dim: usize,
    timeout: Duration,
    client: OnceCell<reqwest::blocking::Client>,
}

impl OllamaEmbedder {
    pub fn new(url: &str, model: &str, dim: usize, timeout_secs: u64) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dim,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            client: OnceCell::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client> {
        self.client.get_or_try_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| RecallError::Extraction(format!("Failed to build HTTP client: {}", e)))
        })
    }
}

impl Embedder for OllamaEmbedder {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client()?
            .post(format!("{}/api/embeddings", self.url))
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .map_err(|e| RecallError::Extraction(format!("Embedding request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(RecallError::Extraction(format!(
                "Embedding model returned HTTP {}",
                response.status()
            )));
        }
        let body: EmbeddingResponse = response
            .json()
            .map_err(|e| RecallError::Extraction(format!("Invalid embedding response: {}", e)))?;
        Ok(body.embedding)
    }
}
