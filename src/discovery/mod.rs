//! Semantic discovery: given a natural-language description, return ranked
//! candidate tool ids with confidence in [0, 1].
//!
//! Indexing composes one text per tool (id + inferred domain + description +
//! capability appendix) and embeds it with a local model. Query-time ranking
//! is hybrid: vector similarity plus rule-based capability and intent
//! enhancements, capped so no single tool is unilaterally promoted. When the
//! model is unavailable the keyword ranker serves every query with the same
//! output shape.

pub mod enhance;

mod embedder;
mod keyword;
mod store;

pub use embedder::{EMBEDDING_DIM, cosine_similarity};
pub use store::{ToolEmbedding, description_hash};

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::catalog::CatalogSnapshot;
use crate::config::{Paths, Settings};
use crate::utils::now_ms;
use embedder::Embedder;
use enhance::{ENHANCEMENT_CAP, capability_bonus, compose_text, infer_domain, intent_bonus, query_words};
use store::EmbeddingStore;

/// Two scores within this distance are a tie; broken by domain keyword, then
/// stable by tool id.
const TIE_EPSILON: f32 = 0.02;

/// Model-version marker recorded when the store is built without vectors.
const FALLBACK_MODEL: &str = "keyword-fallback";

#[derive(Debug, Clone)]
pub struct Candidate {
    pub tool_id: String,
    pub server: String,
    pub tool_name: String,
    pub description: String,
    pub domain: String,
    pub confidence: f32,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Embeddings (re)computed this pass.
    pub indexed: usize,
    /// Entries reused because the description hash was unchanged.
    pub reused: usize,
    /// Orphan entries evicted (tool no longer in the catalog).
    pub removed: usize,
}

pub struct DiscoveryEngine {
    embedder: Option<Arc<Embedder>>,
    store: EmbeddingStore,
    entries: RwLock<Arc<Vec<ToolEmbedding>>>,
    settings: Settings,
}

impl DiscoveryEngine {
    /// Try to load the embedding model; a failed load is not an error, it
    /// just puts the engine in keyword-fallback mode.
    pub fn new(settings: Settings, paths: Paths) -> Self {
        let embedder = match Embedder::load(&settings.embedding_model) {
            Ok(e) => Some(Arc::new(e)),
            Err(e) => {
                warn!("embedding model unavailable, using keyword fallback: {}", e);
                None
            }
        };
        Self {
            embedder,
            store: EmbeddingStore::new(paths),
            entries: RwLock::new(Arc::new(Vec::new())),
            settings,
        }
    }

    /// Keyword-fallback engine, no model load attempt. Used by tests and the
    /// `--no-model` escape hatch.
    pub fn without_model(settings: Settings, paths: Paths) -> Self {
        Self {
            embedder: None,
            store: EmbeddingStore::new(paths),
            entries: RwLock::new(Arc::new(Vec::new())),
            settings,
        }
    }

    pub fn model_enabled(&self) -> bool {
        self.embedder.is_some()
    }

    fn model_version(&self) -> String {
        self.embedder
            .as_ref()
            .map_or_else(|| FALLBACK_MODEL.to_string(), |e| e.model_name().to_string())
    }

    pub fn indexed_count(&self) -> usize {
        self.entries.read().expect("discovery index lock").len()
    }

    /// Index the catalog: reuse entries whose description hash is unchanged,
    /// embed the rest, evict orphans, persist, and swap the in-memory index.
    pub async fn index_catalog(
        &self,
        snapshot: &CatalogSnapshot,
        profile_hash: &str,
    ) -> Result<IndexReport> {
        let model_version = self.model_version();
        let mut existing = self.store.load(&model_version, profile_hash);
        let mut report = IndexReport::default();

        let mut next: BTreeMap<String, ToolEmbedding> = BTreeMap::new();
        let mut to_embed: Vec<(String, String)> = Vec::new();

        for tool in snapshot.all_tools() {
            let tool_id = tool.tool_id();
            let hash = description_hash(&tool.description);
            if let Some(prev) = existing.remove(&tool_id) {
                let vector_ok = !prev.vector.is_empty() || self.embedder.is_none();
                if prev.description_hash == hash && vector_ok {
                    report.reused += 1;
                    next.insert(tool_id, prev);
                    continue;
                }
            }
            let domain = infer_domain(&tool.server);
            let text = compose_text(&tool.server, &tool.name, domain, &tool.description);
            next.insert(
                tool_id.clone(),
                ToolEmbedding {
                    tool_id: tool_id.clone(),
                    vector: Vec::new(),
                    description_hash: hash,
                    last_updated_ms: now_ms(),
                    tool_name: tool.name.clone(),
                    server_name: tool.server.clone(),
                    description: tool.description.clone(),
                    enhanced_description: text.clone(),
                    inferred_domain: domain.to_string(),
                },
            );
            to_embed.push((tool_id, text));
        }
        report.removed = existing.len();
        report.indexed = to_embed.len();

        if let Some(embedder) = &self.embedder {
            if !to_embed.is_empty() {
                let texts: Vec<String> = to_embed.iter().map(|(_, t)| t.clone()).collect();
                let embedder = embedder.clone();
                let vectors =
                    tokio::task::spawn_blocking(move || embedder.embed_batch(texts)).await??;
                for ((tool_id, _), vector) in to_embed.iter().zip(vectors) {
                    if let Some(entry) = next.get_mut(tool_id) {
                        entry.vector = vector;
                    }
                }
            }
        }

        self.store
            .save(&next, &model_version, EMBEDDING_DIM, profile_hash)?;
        let ordered: Vec<ToolEmbedding> = next.into_values().collect();
        *self.entries.write().expect("discovery index lock") = Arc::new(ordered);
        info!(
            "discovery index updated: {} embedded, {} reused, {} evicted",
            report.indexed, report.reused, report.removed
        );
        Ok(report)
    }

    /// Ranked lookup. Results are sorted descending, floored at
    /// `confidence_floor` (profile default when None) and truncated to
    /// `limit`. Deterministic for identical inputs and cached embeddings.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        confidence_floor: Option<f32>,
    ) -> Vec<Candidate> {
        let entries = self.entries.read().expect("discovery index lock").clone();
        let floor = confidence_floor.unwrap_or(self.settings.min_confidence);
        let words = query_words(query);
        if words.is_empty() || entries.is_empty() {
            return Vec::new();
        }

        // Embed the query once per request; skip when no entry has a vector.
        let query_vector = match &self.embedder {
            Some(embedder) if entries.iter().any(|e| !e.vector.is_empty()) => {
                let embedder = embedder.clone();
                let text = query.to_string();
                match tokio::task::spawn_blocking(move || embedder.embed_one(&text)).await {
                    Ok(Ok(v)) => Some(v),
                    Ok(Err(e)) => {
                        warn!("query embedding failed, falling back to keywords: {}", e);
                        None
                    }
                    Err(e) => {
                        warn!("query embedding task failed: {}", e);
                        None
                    }
                }
            }
            _ => None,
        };

        let mut scored: Vec<(f32, &ToolEmbedding)> = entries
            .iter()
            .map(|entry| {
                let base = match &query_vector {
                    Some(qv) if !entry.vector.is_empty() => {
                        cosine_similarity(qv, &entry.vector).max(0.0)
                    }
                    _ => keyword::score(&words, &entry.tool_name, &entry.description),
                };
                let mut enhancement = intent_bonus(&words, &entry.tool_name, &entry.inferred_domain);
                if query_vector.is_some() {
                    enhancement += capability_bonus(&words, &entry.tool_name);
                }
                let score = (base + enhancement.min(ENHANCEMENT_CAP)).clamp(0.0, 1.0);
                (score, entry)
            })
            .collect();

        scored.sort_by(|(sa, ea), (sb, eb)| {
            if (sa - sb).abs() <= TIE_EPSILON {
                let da = domain_matches_query(&words, &ea.inferred_domain);
                let db = domain_matches_query(&words, &eb.inferred_domain);
                db.cmp(&da).then_with(|| ea.tool_id.cmp(&eb.tool_id))
            } else {
                sb.partial_cmp(sa).unwrap_or(std::cmp::Ordering::Equal)
            }
        });

        scored
            .into_iter()
            .filter(|(score, _)| *score >= floor)
            .take(limit)
            .map(|(score, entry)| Candidate {
                tool_id: entry.tool_id.clone(),
                server: entry.server_name.clone(),
                tool_name: entry.tool_name.clone(),
                description: entry.description.clone(),
                domain: entry.inferred_domain.clone(),
                confidence: score,
            })
            .collect()
    }

    /// Embedding similarity between two texts. None in fallback mode — the
    /// caller picks its own keyword heuristic.
    pub async fn similarity(&self, a: &str, b: &str) -> Option<f32> {
        let embedder = self.embedder.clone()?;
        let (a, b) = (a.to_string(), b.to_string());
        let result = tokio::task::spawn_blocking(move || {
            let va = embedder.embed_one(&a)?;
            let vb = embedder.embed_one(&b)?;
            Ok::<f32, anyhow::Error>(cosine_similarity(&va, &vb))
        })
        .await;
        match result {
            Ok(Ok(similarity)) => Some(similarity),
            Ok(Err(e)) => {
                warn!("similarity computation failed: {}", e);
                None
            }
            Err(e) => {
                warn!("similarity task failed: {}", e);
                None
            }
        }
    }
}

fn domain_matches_query(query_words: &[String], domain: &str) -> bool {
    domain
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .any(|domain_word| {
            query_words
                .iter()
                .any(|qw| qw == domain_word || (qw.len() >= 3 && domain_word.starts_with(qw.as_str())))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ToolEntry;
    use serde_json::json;

    fn snapshot_with(tools: Vec<(&str, &str, &str)>) -> CatalogSnapshot {
        let entries: Vec<ToolEntry> = tools
            .into_iter()
            .map(|(server, name, description)| ToolEntry {
                server: server.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                input_schema: json!({"type": "object"}),
                output_schema: None,
            })
            .collect();
        CatalogSnapshot::for_tests(entries)
    }

    fn engine(tmp: &tempfile::TempDir) -> DiscoveryEngine {
        DiscoveryEngine::without_model(Settings::default(), Paths::at(tmp.path().to_path_buf()))
    }

    fn demo_snapshot() -> CatalogSnapshot {
        snapshot_with(vec![
            ("shell", "run_command", "Execute a command in the workspace"),
            ("docs", "search", "Search the documentation index"),
            ("filesystem", "read_file", "Read a file from disk"),
            ("filesystem", "write_file", "Write or overwrite a file on disk"),
        ])
    }

    #[tokio::test]
    async fn keyword_fallback_ranks_read_file_first() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.index_catalog(&demo_snapshot(), "hash-1").await.unwrap();

        let results = engine.search("read file", 5, None).await;
        assert!(!results.is_empty());
        assert_eq!(results[0].tool_id, "filesystem:read_file");
        for window in results.windows(2) {
            assert!(window[0].confidence >= window[1].confidence - TIE_EPSILON);
        }
    }

    #[tokio::test]
    async fn git_commit_routes_to_shell_over_docs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.index_catalog(&demo_snapshot(), "hash-1").await.unwrap();

        let results = engine.search("git commit", 5, Some(0.0)).await;
        let shell_rank = results.iter().position(|c| c.tool_id == "shell:run_command");
        let docs_rank = results.iter().position(|c| c.tool_id == "docs:search");
        assert!(shell_rank.is_some(), "shell tool should surface for git");
        match docs_rank {
            Some(d) => assert!(shell_rank.unwrap() < d, "shell must outrank docs"),
            None => {} // docs fell below even the zero floor slice
        }
        let shell = &results[shell_rank.unwrap()];
        let docs_score = results
            .iter()
            .find(|c| c.tool_id == "docs:search")
            .map_or(0.0, |c| c.confidence);
        assert!(shell.confidence > docs_score);
    }

    #[tokio::test]
    async fn results_respect_limit_floor_and_bounds() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.index_catalog(&demo_snapshot(), "hash-1").await.unwrap();

        let results = engine.search("file", 1, Some(0.1)).await;
        assert!(results.len() <= 1);
        for c in &results {
            assert!((0.0..=1.0).contains(&c.confidence));
        }
    }

    #[tokio::test]
    async fn empty_query_returns_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.index_catalog(&demo_snapshot(), "hash-1").await.unwrap();
        assert!(engine.search("", 5, None).await.is_empty());
        assert!(engine.search("   ", 5, None).await.is_empty());
    }

    #[tokio::test]
    async fn reindex_unchanged_catalog_recomputes_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = engine(&tmp);
        let snapshot = demo_snapshot();

        let first = engine.index_catalog(&snapshot, "hash-1").await.unwrap();
        assert_eq!(first.indexed, 4);
        assert_eq!(first.reused, 0);

        let second = engine.index_catalog(&snapshot, "hash-1").await.unwrap();
        assert_eq!(second.indexed, 0);
        assert_eq!(second.reused, 4);
        assert_eq!(second.removed, 0);
    }

    #[tokio::test]
    async fn reindex_writes_identical_entries() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = Paths::at(tmp.path().to_path_buf());
        let engine = engine(&tmp);
        let snapshot = demo_snapshot();

        engine.index_catalog(&snapshot, "hash-1").await.unwrap();
        let first = std::fs::read_to_string(paths.embeddings_json()).unwrap();
        engine.index_catalog(&snapshot, "hash-1").await.unwrap();
        let second = std::fs::read_to_string(paths.embeddings_json()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn removed_tool_evicts_embedding() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.index_catalog(&demo_snapshot(), "hash-1").await.unwrap();

        let smaller = snapshot_with(vec![("docs", "search", "Search the documentation index")]);
        let report = engine.index_catalog(&smaller, "hash-1").await.unwrap();
        assert_eq!(report.removed, 3);
        assert_eq!(engine.indexed_count(), 1);

        let results = engine.search("read file", 5, Some(0.0)).await;
        assert!(results.iter().all(|c| c.tool_id != "filesystem:read_file"));
    }

    #[tokio::test]
    async fn changed_description_is_reembedded() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.index_catalog(&demo_snapshot(), "hash-1").await.unwrap();

        let changed = snapshot_with(vec![
            ("shell", "run_command", "Execute a command in the workspace"),
            ("docs", "search", "Search the documentation AND the wiki"),
            ("filesystem", "read_file", "Read a file from disk"),
            ("filesystem", "write_file", "Write or overwrite a file on disk"),
        ]);
        let report = engine.index_catalog(&changed, "hash-1").await.unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(report.reused, 3);
    }

    #[test]
    fn domain_match_helper() {
        let words: Vec<String> = vec!["search".to_string(), "the".to_string()];
        assert!(domain_matches_query(&words, "documentation search"));
        assert!(!domain_matches_query(&words, "payments and billing"));
    }
}
