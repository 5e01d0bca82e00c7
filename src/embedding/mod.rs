//! Embedder collaborator and a deterministic hashing default.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::processing::sampling::EmbeddingSample;

/// Errors raised by embedding collaborators.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// Provider was unable to produce embeddings for the supplied input.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
}

/// Result of a successful embedding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmbedReceipt {
    /// Vectors stored for the artifact.
    pub stored_count: usize,
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed the sampled rows of a stored artifact.
    async fn embed(
        &self,
        artifact_id: &str,
        metadata: &Value,
        sample: &EmbeddingSample,
    ) -> Result<EmbedReceipt, EmbedError>;
}

/// Deterministic embedder that hashes row text into fixed-size vectors and keeps them in memory.
pub struct HashingEmbedder {
    dimension: usize,
    vectors: RwLock<HashMap<String, Vec<Vec<f32>>>>,
}

impl HashingEmbedder {
    /// Create an embedder producing `dimension`-sized vectors.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: RwLock::new(HashMap::new()),
        }
    }

    /// Vector dimensionality.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Vectors stored for `artifact_id`.
    pub async fn stored(&self, artifact_id: &str) -> Option<Vec<Vec<f32>>> {
        self.vectors.read().await.get(artifact_id).cloned()
    }

    fn encode(text: &str, dimension: usize) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; dimension];

        if text.is_empty() {
            return embedding;
        }

        for (idx, byte) in text.bytes().enumerate() {
            let position = idx % dimension;
            embedding[position] += f32::from(byte) / 255.0;
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(
        &self,
        artifact_id: &str,
        metadata: &Value,
        sample: &EmbeddingSample,
    ) -> Result<EmbedReceipt, EmbedError> {
        if self.dimension == 0 {
            return Err(EmbedError::GenerationFailed(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        if sample.is_empty() {
            return Err(EmbedError::GenerationFailed(
                "no sampled rows provided".to_string(),
            ));
        }

        let file_type = metadata
            .get("file_type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        tracing::debug!(
            artifact_id,
            dimension = self.dimension,
            rows = sample.len(),
            stride = sample.stride,
            file_type,
            "Generating embeddings"
        );

        let embeddings: Vec<Vec<f32>> = sample
            .rows
            .iter()
            .map(|row| Self::encode(&row.payload.to_string(), self.dimension))
            .collect();
        let stored_count = embeddings.len();
        self.vectors
            .write()
            .await
            .insert(artifact_id.to_string(), embeddings);

        Ok(EmbedReceipt { stored_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::sampling::EmbeddingSampler;
    use serde_json::json;

    fn sample(count: usize) -> EmbeddingSample {
        let rows: Vec<_> = (0..count)
            .map(|n| {
                let Value::Object(row) = json!({ "n": n }) else {
                    unreachable!()
                };
                row
            })
            .collect();
        EmbeddingSampler::new(10).unwrap().sample(&rows)
    }

    #[tokio::test]
    async fn embeds_one_vector_per_sampled_row() {
        let embedder = HashingEmbedder::new(8);
        let receipt = embedder
            .embed("artifact", &json!({ "file_type": "csv" }), &sample(25))
            .await
            .unwrap();
        assert_eq!(receipt.stored_count, 3);

        let vectors = embedder.stored("artifact").await.unwrap();
        assert_eq!(vectors.len(), 3);
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn encoding_is_deterministic() {
        assert_eq!(
            HashingEmbedder::encode("{\"n\":1}", 16),
            HashingEmbedder::encode("{\"n\":1}", 16)
        );
        assert!(HashingEmbedder::encode("", 4).iter().all(|v| *v == 0.0));
    }

    #[tokio::test]
    async fn rejects_empty_samples_and_zero_dimension() {
        assert!(
            HashingEmbedder::new(8)
                .embed("a", &json!({}), &sample(0))
                .await
                .is_err()
        );
        assert!(
            HashingEmbedder::new(0)
                .embed("a", &json!({}), &sample(3))
                .await
                .is_err()
        );
    }
}
