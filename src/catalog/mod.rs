//! The tool catalog: a durable, queryable union of every tool exposed by the
//! active profile's servers.
//!
//! Readers (router, discovery) see an immutable snapshot behind an atomic
//! `Arc` swap; rebuild and refresh passes are the single writer. Probing runs
//! per-server with individual deadlines so one hung server never delays the
//! others.

mod cache;

pub use cache::{CacheMetadata, csv_escape, read_csv_index};

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::config::{Paths, Profile, profile_hash, server_config_hash};
use crate::supervisor::{DownstreamInfo, Supervisor};
use crate::utils::now_ms;

/// One tool in the live catalog. Identity is `(server, name)`; the string
/// form `server:name` is the stable external id.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
}

impl ToolEntry {
    pub fn tool_id(&self) -> String {
        format!("{}:{}", self.server, self.name)
    }
}

/// Immutable view of the catalog at one point in time.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    tools: Vec<ToolEntry>,
    by_id: HashMap<String, usize>,
    pub server_info: BTreeMap<String, DownstreamInfo>,
    pub config_schemas: BTreeMap<String, Value>,
    pub metadata: CacheMetadata,
}

impl CatalogSnapshot {
    fn build(
        tools: Vec<ToolEntry>,
        server_info: BTreeMap<String, DownstreamInfo>,
        config_schemas: BTreeMap<String, Value>,
        metadata: CacheMetadata,
    ) -> Self {
        let by_id = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.tool_id(), i))
            .collect();
        Self {
            tools,
            by_id,
            server_info,
            config_schemas,
            metadata,
        }
    }

    pub fn all_tools(&self) -> &[ToolEntry] {
        &self.tools
    }

    pub fn tools_of(&self, server: &str) -> Vec<&ToolEntry> {
        self.tools.iter().filter(|t| t.server == server).collect()
    }

    pub fn get(&self, tool_id: &str) -> Option<&ToolEntry> {
        self.by_id.get(tool_id).map(|&i| &self.tools[i])
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Snapshot from bare tool entries; unit-test constructor.
    #[cfg(test)]
    pub fn for_tests(tools: Vec<ToolEntry>) -> Self {
        Self::build(
            tools,
            BTreeMap::new(),
            BTreeMap::new(),
            CacheMetadata::default(),
        )
    }
}

/// Outcome of a rebuild pass, for logs and the status surface.
#[derive(Debug, Default)]
pub struct RebuildReport {
    pub probed: Vec<String>,
    pub failed: Vec<String>,
    pub retained_from_cache: Vec<String>,
    pub total_tools: usize,
}

pub struct Catalog {
    profile: Arc<Profile>,
    paths: Paths,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
}

impl Catalog {
    pub fn new(profile: Arc<Profile>, paths: Paths) -> Self {
        Self {
            profile,
            paths,
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::default())),
        }
    }

    /// Cheap copy-on-write read; callers hold the `Arc` as long as they like.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().expect("catalog snapshot lock").clone()
    }

    fn swap(&self, next: CatalogSnapshot) -> Arc<CatalogSnapshot> {
        let next = Arc::new(next);
        *self.snapshot.write().expect("catalog snapshot lock") = next.clone();
        next
    }

    /// Try to serve from the persisted cache. Returns true when the cache was
    /// authoritative (profile hash matched and it was younger than the max
    /// age) and is now the live snapshot.
    pub fn load_cached(&self) -> bool {
        let Some(loaded) = cache::load(&self.paths) else {
            return false;
        };
        let fresh = loaded.metadata.config_hash == profile_hash(&self.profile)
            && !loaded
                .metadata
                .older_than_days(self.profile.settings.cache_max_age_days);
        if !fresh {
            info!("tool cache is stale; rebuild required");
            return false;
        }
        let total = loaded.metadata.total_tools;
        self.swap(loaded);
        info!("tool catalog served from cache ({} tools)", total);
        true
    }

    /// Whether the persisted cache disagrees with the current profile.
    pub fn is_stale(&self) -> bool {
        let snapshot = self.snapshot();
        snapshot.metadata.config_hash != profile_hash(&self.profile)
            || snapshot
                .metadata
                .older_than_days(self.profile.settings.cache_max_age_days)
    }

    /// Full re-probe pass. Servers that fail to probe keep their cached slice
    /// when their config hash is unchanged; a changed config always discards
    /// the old slice.
    pub async fn rebuild(&self, supervisor: &Supervisor, reason: &str) -> RebuildReport {
        info!("rebuilding tool catalog ({})", reason);
        let previous = self.snapshot();
        let mut report = RebuildReport::default();

        let names: Vec<String> = self.profile.servers.keys().cloned().collect();
        let probes = futures_util::future::join_all(
            names.iter().map(|name| supervisor.probe(name)),
        )
        .await;

        let mut tools = Vec::new();
        let mut server_info = BTreeMap::new();
        let mut config_schemas = BTreeMap::new();
        let mut per_server_hash = BTreeMap::new();

        for (name, outcome) in names.iter().zip(probes) {
            let config = &self.profile.servers[name];
            let hash = server_config_hash(config);
            match outcome {
                Ok(probe) => {
                    report.probed.push(name.clone());
                    server_info.insert(name.clone(), probe.info);
                    if let Some(schema) = probe.config_schema {
                        config_schemas.insert(name.clone(), schema);
                    }
                    for tool in probe.tools {
                        tools.push(ToolEntry {
                            server: name.clone(),
                            name: tool.name,
                            description: tool.description,
                            input_schema: tool.input_schema,
                            output_schema: tool.output_schema,
                        });
                    }
                    per_server_hash.insert(name.clone(), hash);
                }
                Err(err) => {
                    report.failed.push(name.clone());
                    let cached_hash = previous.metadata.per_server_hash.get(name);
                    if cached_hash == Some(&hash) {
                        // Unchanged config: keep what we knew.
                        warn!(
                            "probe of '{}' failed ({}); retaining cached tools",
                            name, err
                        );
                        report.retained_from_cache.push(name.clone());
                        for tool in previous.tools_of(name) {
                            tools.push(tool.clone());
                        }
                        if let Some(info) = previous.server_info.get(name) {
                            server_info.insert(name.clone(), info.clone());
                        }
                        if let Some(schema) = previous.config_schemas.get(name) {
                            config_schemas.insert(name.clone(), schema.clone());
                        }
                        per_server_hash.insert(name.clone(), hash);
                    } else {
                        warn!(
                            "probe of '{}' failed ({}); config changed, discarding cached tools",
                            name, err
                        );
                    }
                }
            }
        }

        report.total_tools = tools.len();
        let metadata = CacheMetadata {
            version: cache::CACHE_VERSION,
            created_at_ms: now_ms(),
            config_hash: profile_hash(&self.profile),
            per_server_hash,
            total_tools: tools.len(),
        };
        let next = CatalogSnapshot::build(tools, server_info, config_schemas, metadata);
        if let Err(e) = cache::persist(&self.paths, &next) {
            warn!("failed to persist tool cache: {}", e);
        }
        self.swap(next);
        info!(
            "catalog rebuilt: {} tools from {} servers ({} failed)",
            report.total_tools,
            report.probed.len(),
            report.failed.len()
        );
        report
    }

    /// Probe one server and reconcile its slice into a fresh snapshot.
    pub async fn refresh_server(
        &self,
        supervisor: &Supervisor,
        name: &str,
    ) -> crate::errors::PatchbayResult<()> {
        let probe = supervisor.probe(name).await?;
        let previous = self.snapshot();

        let mut tools: Vec<ToolEntry> = previous
            .tools
            .iter()
            .filter(|t| t.server != name)
            .cloned()
            .collect();
        for tool in probe.tools {
            tools.push(ToolEntry {
                server: name.to_string(),
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
                output_schema: tool.output_schema,
            });
        }

        let mut server_info = previous.server_info.clone();
        server_info.insert(name.to_string(), probe.info);
        let mut config_schemas = previous.config_schemas.clone();
        if let Some(schema) = probe.config_schema {
            config_schemas.insert(name.to_string(), schema);
        }

        let mut per_server_hash = previous.metadata.per_server_hash.clone();
        if let Some(config) = self.profile.servers.get(name) {
            per_server_hash.insert(name.to_string(), server_config_hash(config));
        }

        let metadata = CacheMetadata {
            version: cache::CACHE_VERSION,
            created_at_ms: now_ms(),
            config_hash: profile_hash(&self.profile),
            per_server_hash,
            total_tools: tools.len(),
        };
        let next = CatalogSnapshot::build(tools, server_info, config_schemas, metadata);
        if let Err(e) = cache::persist(&self.paths, &next) {
            warn!("failed to persist tool cache: {}", e);
        }
        self.swap(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{profile_with, scripted_server, sh_server, silent_server};

    fn setup(
        tmp: &tempfile::TempDir,
        profile: Profile,
    ) -> (Arc<Profile>, Paths, Supervisor, Catalog) {
        let paths = Paths::at(tmp.path().to_path_buf());
        paths.ensure_layout().unwrap();
        let profile = Arc::new(profile);
        let supervisor = Supervisor::new(profile.clone(), paths.clone());
        let catalog = Catalog::new(profile.clone(), paths.clone());
        (profile, paths, supervisor, catalog)
    }

    #[tokio::test]
    async fn rebuild_populates_snapshot_and_cache_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (_, paths, supervisor, catalog) =
            setup(&tmp, profile_with(vec![("files", scripted_server())]));

        let report = catalog.rebuild(&supervisor, "test").await;
        assert_eq!(report.total_tools, 2);
        assert!(report.failed.is_empty());

        let snapshot = catalog.snapshot();
        assert!(snapshot.get("files:read_file").is_some());
        assert!(snapshot.get("files:write_file").is_some());
        assert_eq!(snapshot.tools_of("files").len(), 2);
        assert!(paths.all_tools_json().exists());
        assert!(paths.all_tools_csv().exists());
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn cache_roundtrip_is_authoritative_when_hash_matches() {
        let tmp = tempfile::TempDir::new().unwrap();
        let profile = profile_with(vec![("files", scripted_server())]);
        let (profile_arc, paths, supervisor, catalog) = setup(&tmp, profile);
        catalog.rebuild(&supervisor, "test").await;
        supervisor.stop_all().await;

        // Fresh catalog instance, same profile: cache is authoritative.
        let reloaded = Catalog::new(profile_arc, paths);
        assert!(reloaded.load_cached());
        assert_eq!(reloaded.snapshot().len(), 2);
        assert!(!reloaded.is_stale());
    }

    #[tokio::test]
    async fn changed_server_config_invalidates_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (_, paths, supervisor, catalog) =
            setup(&tmp, profile_with(vec![("files", scripted_server())]));
        catalog.rebuild(&supervisor, "test").await;
        supervisor.stop_all().await;

        // Same server name, different command.
        let changed = Arc::new(profile_with(vec![("files", sh_server("sleep 60"))]));
        let reloaded = Catalog::new(changed, paths);
        assert!(!reloaded.load_cached());
    }

    #[tokio::test]
    async fn hung_server_is_excluded_but_healthy_one_survives() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut profile = profile_with(vec![
            ("good", scripted_server()),
            ("hung", silent_server()),
        ]);
        profile.settings.handshake_timeout_secs = 1;
        let (_, _, supervisor, catalog) = setup(&tmp, profile);

        let report = catalog.rebuild(&supervisor, "test").await;
        assert_eq!(report.probed, vec!["good".to_string()]);
        assert_eq!(report.failed, vec!["hung".to_string()]);

        let snapshot = catalog.snapshot();
        assert!(snapshot.get("good:read_file").is_some());
        assert!(snapshot.tools_of("hung").is_empty());
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn failed_probe_with_unchanged_config_retains_cached_slice() {
        let tmp = tempfile::TempDir::new().unwrap();
        let profile = profile_with(vec![("files", scripted_server())]);
        let (profile_arc, paths, supervisor, catalog) = setup(&tmp, profile);
        catalog.rebuild(&supervisor, "initial").await;
        supervisor.stop_all().await;

        // Quarantine the server so the next probe fails, then rebuild from
        // the cached snapshot.
        let supervisor2 = Supervisor::new(profile_arc.clone(), paths.clone());
        supervisor2.set_enabled("files", false, None);
        let catalog2 = Catalog::new(profile_arc, paths);
        assert!(catalog2.load_cached());
        let report = catalog2.rebuild(&supervisor2, "requarantine").await;
        assert_eq!(report.retained_from_cache, vec!["files".to_string()]);
        assert_eq!(catalog2.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn refresh_server_reconciles_one_slice() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (_, _, supervisor, catalog) = setup(
            &tmp,
            profile_with(vec![("a", scripted_server()), ("b", scripted_server())]),
        );
        catalog.rebuild(&supervisor, "test").await;
        assert_eq!(catalog.snapshot().len(), 4);

        catalog.refresh_server(&supervisor, "a").await.unwrap();
        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.len(), 4);
        assert!(snapshot.get("a:read_file").is_some());
        assert!(snapshot.get("b:write_file").is_some());
        supervisor.stop_all().await;
    }
}
