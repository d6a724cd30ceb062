//! Embedding backends and vector utilities.
//!
//! Two interchangeable backends produce fixed-dimension unit-norm vectors:
//!
//! - **Hash backend** (`hash-v1`) — deterministic and dependency-free. Each
//!   unique token is hashed with SHA-256, the first 8 bytes select a bucket
//!   modulo the dimension, and the bucket counts are L2-normalized.
//! - **Model backend** (`model:<name>`) — wraps a pretrained
//!   sentence-embedding model via fastembed, behind the `model-embeddings`
//!   feature. Default model: `all-MiniLM-L6-v2` (384-d).
//!
//! The backend id is persisted with every stored vector; a mismatch between
//! stored and active backend marks those vectors stale and forces
//! regeneration.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::config::EmbeddingsConfig;
use crate::error::{KeeperError, Result};
use crate::parser;

/// Dimension of the hash fallback backend.
pub const HASH_DIMENSION: usize = 64;

/// Backend id of the hash fallback.
pub const HASH_BACKEND_ID: &str = "hash-v1";

/// Capability set of an embedding backend: identity and dimension. The
/// vector computation itself goes through [`embed_texts`].
pub trait Embedder: Send + Sync {
    /// Stable backend identity, e.g. `"hash-v1"` or `"model:all-MiniLM-L6-v2"`.
    fn backend_id(&self) -> &str;
    /// Output vector dimension.
    fn dimension(&self) -> usize;
}

/// Deterministic hash-based embedder, always available.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            dimension: HASH_DIMENSION,
        }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for HashEmbedder {
    fn backend_id(&self) -> &str {
        HASH_BACKEND_ID
    }
    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Model-backed embedder identity. Inference runs through [`embed_texts`].
#[cfg(feature = "model-embeddings")]
pub struct ModelEmbedder {
    backend_id: String,
    dimension: usize,
}

#[cfg(feature = "model-embeddings")]
impl ModelEmbedder {
    pub fn new(config: &EmbeddingsConfig) -> Self {
        Self {
            backend_id: format!("model:{}", config.model),
            dimension: model_dimension(&config.model),
        }
    }
}

#[cfg(feature = "model-embeddings")]
impl Embedder for ModelEmbedder {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }
    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(feature = "model-embeddings")]
fn model_dimension(model: &str) -> usize {
    match model {
        "all-MiniLM-L6-v2" => 384,
        "bge-small-en-v1.5" => 384,
        "bge-base-en-v1.5" => 768,
        "nomic-embed-text-v1.5" => 768,
        _ => 384,
    }
}

/// Instantiate the embedder selected by configuration.
///
/// `backend = "model"` requires the `model-embeddings` feature; without it
/// the call fails with a `Backend` error so callers can fall back explicitly.
pub fn create_embedder(config: &EmbeddingsConfig) -> Result<Box<dyn Embedder>> {
    match config.backend.as_str() {
        "hash" => Ok(Box::new(HashEmbedder::new())),
        #[cfg(feature = "model-embeddings")]
        "model" => Ok(Box::new(ModelEmbedder::new(config))),
        #[cfg(not(feature = "model-embeddings"))]
        "model" => Err(KeeperError::Backend(
            "model backend requires the model-embeddings feature".to_string(),
        )),
        other => Err(KeeperError::Backend(format!(
            "unknown embeddings backend: {other}"
        ))),
    }
}

/// Embed a batch of texts with the configured backend, in input order.
pub async fn embed_texts(
    embedder: &dyn Embedder,
    config: &EmbeddingsConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    match config.backend.as_str() {
        "hash" => Ok(texts
            .iter()
            .map(|t| hash_embed(t, embedder.dimension()))
            .collect()),
        #[cfg(feature = "model-embeddings")]
        "model" => embed_model(config, texts).await,
        other => Err(KeeperError::Backend(format!(
            "unknown embeddings backend: {other}"
        ))),
    }
}

/// Embed a single query text.
pub async fn embed_text(
    embedder: &dyn Embedder,
    config: &EmbeddingsConfig,
    text: &str,
) -> Result<Vec<f32>> {
    let results = embed_texts(embedder, config, &[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| KeeperError::Backend("empty embedding batch".to_string()))
}

#[cfg(feature = "model-embeddings")]
async fn embed_model(config: &EmbeddingsConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let model_name = config.model.clone();
    let texts = texts.to_vec();

    tokio::task::spawn_blocking(move || {
        let model = match model_name.as_str() {
            "all-MiniLM-L6-v2" => fastembed::EmbeddingModel::AllMiniLML6V2,
            "bge-small-en-v1.5" => fastembed::EmbeddingModel::BGESmallENV15,
            "bge-base-en-v1.5" => fastembed::EmbeddingModel::BGEBaseENV15,
            "nomic-embed-text-v1.5" => fastembed::EmbeddingModel::NomicEmbedTextV15,
            other => {
                return Err(KeeperError::Backend(format!(
                    "unknown embedding model: {other}"
                )))
            }
        };
        let mut engine = fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(model))
            .map_err(|e| KeeperError::Backend(format!("model init failed: {e}")))?;
        let vectors = engine
            .embed(texts, None)
            .map_err(|e| KeeperError::Backend(format!("model inference failed: {e}")))?;
        Ok(vectors.into_iter().map(|v| l2_normalize(&v)).collect())
    })
    .await
    .map_err(|e| KeeperError::Backend(format!("embedding task failed: {e}")))?
}

/// Deterministic token-bucket embedding, L2-normalized.
pub fn hash_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension];

    let tokens: BTreeSet<String> = parser::tokenize(text).into_iter().collect();
    for token in tokens {
        let digest = Sha256::digest(token.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_be_bytes(prefix) % dimension as u64) as usize;
        vector[bucket] += 1.0;
    }

    l2_normalize(&vector)
}

/// Scale a vector to unit L2 norm. Zero vectors are returned unchanged.
pub fn l2_normalize(vector: &[f32]) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}

/// Cosine similarity between two vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f64::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embedding_has_unit_norm_and_dimension() {
        let v = hash_embed("kubernetes deployment guide", HASH_DIMENSION);
        assert_eq!(v.len(), HASH_DIMENSION);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    #[test]
    fn hash_embedding_is_deterministic() {
        let a = hash_embed("same input text", 64);
        let b = hash_embed("same input text", 64);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_embedding_of_empty_text_is_zero() {
        let v = hash_embed("", 64);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn similar_texts_score_higher_than_disjoint() {
        let query = hash_embed("kubernetes deployment", 64);
        let related = hash_embed("kubernetes deployment cluster rollout", 64);
        let unrelated = hash_embed("gardening tomato watering", 64);
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn hash_backend_identity() {
        let embedder = HashEmbedder::new();
        assert_eq!(embedder.backend_id(), "hash-v1");
        assert_eq!(embedder.dimension(), 64);
    }

    #[tokio::test]
    async fn embed_texts_dispatches_to_hash() {
        let config = EmbeddingsConfig::default();
        let embedder = create_embedder(&config).unwrap();
        let out = embed_texts(embedder.as_ref(), &config, &["alpha beta".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 64);
    }
}
