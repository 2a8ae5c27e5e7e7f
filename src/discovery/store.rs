//! Persistent embedding store: `cache/embeddings.json` keyed by toolId, plus
//! a metadata document recording the model version and profile hash the
//! vectors were produced under. A mismatch on either discards the store;
//! re-embedding is deferred to the next indexing pass.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::config::Paths;
use crate::utils::{atomic_write, now_ms};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEmbedding {
    #[serde(rename = "toolId")]
    pub tool_id: String,
    /// Empty in fallback mode; skipped during vector scoring.
    #[serde(default)]
    pub vector: Vec<f32>,
    #[serde(rename = "descriptionHash")]
    pub description_hash: String,
    #[serde(rename = "lastUpdatedMs")]
    pub last_updated_ms: i64,
    #[serde(rename = "toolName")]
    pub tool_name: String,
    #[serde(rename = "serverName")]
    pub server_name: String,
    #[serde(default)]
    pub description: String,
    /// The composed text the vector was produced from; recorded so
    /// re-indexing is deterministic.
    #[serde(rename = "enhancedDescription", default)]
    pub enhanced_description: String,
    #[serde(rename = "inferredDomain", default)]
    pub inferred_domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreMetadata {
    #[serde(rename = "modelVersion", default)]
    pub model_version: String,
    #[serde(default)]
    pub dimension: usize,
    #[serde(rename = "profileHash", default)]
    pub profile_hash: String,
    #[serde(rename = "createdAtMs", default)]
    pub created_at_ms: i64,
}

pub fn description_hash(description: &str) -> String {
    hex::encode(Sha256::digest(description.as_bytes()))
}

pub struct EmbeddingStore {
    paths: Paths,
}

impl EmbeddingStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    /// Load persisted embeddings if they were produced under the same model
    /// and profile; otherwise discard and start empty.
    pub fn load(
        &self,
        expected_model: &str,
        expected_profile_hash: &str,
    ) -> BTreeMap<String, ToolEmbedding> {
        let metadata: StoreMetadata = match std::fs::read_to_string(self.paths.embeddings_metadata_json())
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
        {
            Some(m) => m,
            None => return BTreeMap::new(),
        };
        if metadata.model_version != expected_model {
            info!(
                "embedding store was built with model '{}', want '{}'; discarding",
                metadata.model_version, expected_model
            );
            return BTreeMap::new();
        }
        if metadata.profile_hash != expected_profile_hash {
            info!("embedding store profile hash mismatch; discarding");
            return BTreeMap::new();
        }

        match std::fs::read_to_string(self.paths.embeddings_json()) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, ToolEmbedding>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("discarding unreadable embedding store: {}", e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        }
    }

    /// Persist entries and metadata atomically, entries first so a matching
    /// metadata document never points at missing vectors.
    pub fn save(
        &self,
        entries: &BTreeMap<String, ToolEmbedding>,
        model_version: &str,
        dimension: usize,
        profile_hash: &str,
    ) -> Result<()> {
        let json = serde_json::to_string(entries).context("serializing embeddings")?;
        atomic_write(&self.paths.embeddings_json(), &json)?;
        let metadata = StoreMetadata {
            model_version: model_version.to_string(),
            dimension,
            profile_hash: profile_hash.to_string(),
            created_at_ms: now_ms(),
        };
        let meta_json =
            serde_json::to_string_pretty(&metadata).context("serializing embedding metadata")?;
        atomic_write(&self.paths.embeddings_metadata_json(), &meta_json)?;
        Ok(())
    }
}
