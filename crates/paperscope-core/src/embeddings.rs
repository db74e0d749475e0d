//! Embedding runtime wrapper.
//!
//! The engine only ever needs "embed a batch of strings -> vectors"; the
//! model runtime itself stays behind this wrapper. The default backend
//! talks to a local Ollama-compatible server over HTTP and is initialized
//! lazily on first use. `Embedder::mock` provides a deterministic hashed
//! bag-of-words embedding so tests never touch a model server.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::segment::tokenize;

const DEFAULT_ENDPOINT: &str = "http://localhost:11434";
const ENDPOINT_ENV: &str = "PAPERSCOPE_EMBEDDING_URL";

/// Dimensionality of the mock backend's vectors.
const MOCK_DIMENSIONS: usize = 128;

pub struct Embedder {
    backend: Backend,
}

enum Backend {
    Remote {
        model: String,
        endpoint: String,
        client: OnceCell<reqwest::Client>,
    },
    Mock {
        dimensions: usize,
    },
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl Embedder {
    /// Embedder backed by an Ollama-compatible `/api/embed` endpoint.
    ///
    /// `model` comes from the package manifest's `embedding` key. The
    /// endpoint defaults to `http://localhost:11434` and can be overridden
    /// with `PAPERSCOPE_EMBEDDING_URL`. Nothing is connected until the
    /// first embed call.
    pub fn remote(model: &str) -> Self {
        let endpoint =
            std::env::var(ENDPOINT_ENV).unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        Self {
            backend: Backend::Remote {
                model: model.to_string(),
                endpoint,
                client: OnceCell::new(),
            },
        }
    }

    /// Deterministic offline embedder for tests.
    pub fn mock() -> Self {
        Self {
            backend: Backend::Mock {
                dimensions: MOCK_DIMENSIONS,
            },
        }
    }

    /// Embed a single text (queries).
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Embedding("empty embedding response".into()))
    }

    /// Embed a batch of texts, one vector per input, in order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        match &self.backend {
            Backend::Mock { dimensions } => Ok(texts
                .iter()
                .map(|text| hashed_bag_of_words(text, *dimensions))
                .collect()),
            Backend::Remote {
                model,
                endpoint,
                client,
            } => {
                let client = client
                    .get_or_try_init(|| async {
                        reqwest::Client::builder()
                            .build()
                            .map_err(|e| Error::Embedding(e.to_string()))
                    })
                    .await?;

                tracing::debug!(model = %model, batch = texts.len(), "Embedding batch");

                let response = client
                    .post(format!("{endpoint}/api/embed"))
                    .json(&serde_json::json!({ "model": model, "input": texts }))
                    .send()
                    .await
                    .map_err(|e| Error::Embedding(format!("request failed: {e}")))?;

                if !response.status().is_success() {
                    return Err(Error::Embedding(format!(
                        "embedding server returned {}",
                        response.status()
                    )));
                }

                let body: EmbedResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::Embedding(format!("malformed response: {e}")))?;

                if body.embeddings.len() != texts.len() {
                    return Err(Error::Embedding(format!(
                        "expected {} vectors, got {}",
                        texts.len(),
                        body.embeddings.len()
                    )));
                }
                Ok(body.embeddings)
            }
        }
    }
}

/// Token-bucket embedding: each token hashes to a dimension, counts are
/// L2-normalized. Texts sharing vocabulary land close under cosine
/// distance, which is all the tests need.
fn hashed_bag_of_words(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimensions];
    for token in tokenize(text) {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        vector[(hasher.finish() as usize) % dimensions] += 1.0;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

/// Cosine distance in `[0, 2]`; zero-norm inputs land at 1.0 (no signal).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_is_deterministic() {
        let embedder = Embedder::mock();
        let a = embedder.embed("transference analysis").await.unwrap();
        let b = embedder.embed("transference analysis").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn shared_vocabulary_is_closer() {
        let embedder = Embedder::mock();
        let query = embedder.embed("transference analysis").await.unwrap();
        let near = embedder
            .embed("notes about transference in therapy")
            .await
            .unwrap();
        let far = embedder.embed("grocery shopping list").await.unwrap();

        assert!(cosine_distance(&query, &near) < cosine_distance(&query, &far));
    }

    #[tokio::test]
    async fn batch_preserves_order_and_length() {
        let embedder = Embedder::mock();
        let texts = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[1], embedder.embed("two").await.unwrap());
    }

    #[test]
    fn cosine_distance_bounds() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((cosine_distance(&a, &a)).abs() < 1e-6);
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[], &[]), 1.0);
    }
}
