//! Local embedding generation via fastembed (ONNX-based, no API key needed).
//!
//! The engine runs in two modes: model-enabled (real vectors, cosine
//! similarity) or fallback (model failed to load or the `embeddings` feature
//! is off) where the keyword ranker serves every query. Loading never aborts
//! startup — a failed load just means fallback.

use anyhow::Result;

#[cfg(feature = "embeddings")]
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
#[cfg(feature = "embeddings")]
use tracing::info;

/// Vector dimension of the supported models.
pub const EMBEDDING_DIM: usize = 384;

#[cfg(feature = "embeddings")]
pub struct Embedder {
    model: TextEmbedding,
    model_name: String,
}

#[cfg(feature = "embeddings")]
impl Embedder {
    /// Load the embedding model. Downloads on first use (~30MB).
    pub fn load(model_name: &str) -> Result<Self> {
        let model_type = match model_name {
            "BAAI/bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
            "BAAI/bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
            _ => {
                anyhow::bail!(
                    "unsupported embedding model '{}'; use BAAI/bge-small-en-v1.5 or BAAI/bge-base-en-v1.5",
                    model_name
                );
            }
        };

        let model =
            TextEmbedding::try_new(InitOptions::new(model_type).with_show_download_progress(false))?;
        info!("embedding model loaded: {}", model_name);
        Ok(Self {
            model,
            model_name: model_name.to_string(),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Embed multiple texts (batch). Returns one vector per text.
    pub fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let embeddings = self.model.embed(texts, None)?;
        Ok(embeddings)
    }

    /// Embed a single query string.
    pub fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.model.embed(vec![text.to_string()], None)?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty embedding result"))
    }
}

/// Stub when the `embeddings` feature is off: loading always fails, which
/// puts the engine in fallback mode.
#[cfg(not(feature = "embeddings"))]
pub struct Embedder {
    _private: (),
}

#[cfg(not(feature = "embeddings"))]
impl Embedder {
    pub fn load(_model_name: &str) -> Result<Self> {
        anyhow::bail!("built without the 'embeddings' feature")
    }

    pub fn model_name(&self) -> &str {
        "none"
    }

    pub fn embed_batch(&self, _texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        anyhow::bail!("built without the 'embeddings' feature")
    }

    pub fn embed_one(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("built without the 'embeddings' feature")
    }
}

/// Cosine similarity between two vectors. fastembed produces normalized
/// vectors, so dot product equals cosine similarity.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let v = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_mismatched_or_empty() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
