//! Downstream server lifecycle and dispatch.
//!
//! The supervisor owns at most one live transport per configured server,
//! performs the protocol handshake, tracks health, applies retry backoff,
//! and mediates every call. Concurrent calls to one server multiplex over
//! its single transport; calls to different servers proceed in parallel.

pub mod diagnostics;
pub mod health;
mod http;
mod transport;

pub use diagnostics::ConfigHint;
pub use health::{HealthRecord, HealthState, HealthStore};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Paths, Profile, ServerConfig};
use crate::errors::{PatchbayError, PatchbayResult};
use crate::utils::logsink::LogSink;
use crate::utils::now_ms;
use http::HttpTransport;
use transport::StdioTransport;

/// `serverInfo` declared by a downstream server during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DownstreamInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// One tool as declared in a `tools/list` response.
#[derive(Debug, Clone)]
pub struct ProbedTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
}

/// Everything a successful probe learns about one server.
#[derive(Debug, Clone)]
pub struct ServerProbe {
    pub info: DownstreamInfo,
    pub tools: Vec<ProbedTool>,
    pub config_schema: Option<Value>,
}

enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl Transport {
    async fn request(&self, method: &str, params: Value, timeout: Duration) -> PatchbayResult<Value> {
        match self {
            Transport::Stdio(t) => t.request(method, params, timeout).await,
            Transport::Http(t) => t.request(method, params, timeout).await,
        }
    }

    async fn notify(&self, method: &str, params: Value) -> PatchbayResult<()> {
        match self {
            Transport::Stdio(t) => t.notify(method, params),
            Transport::Http(t) => t.notify(method, params).await,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Transport::Stdio(t) => t.is_closed(),
            // HTTP is connectionless; every request stands alone.
            Transport::Http(_) => false,
        }
    }

    fn recent_stderr(&self) -> Vec<String> {
        match self {
            Transport::Stdio(t) => t.recent_stderr(),
            Transport::Http(_) => Vec::new(),
        }
    }

    async fn shutdown(&self) {
        if let Transport::Stdio(t) = self {
            t.shutdown().await;
        }
    }
}

#[derive(Default)]
struct ServerEntry {
    transport: Option<Arc<Transport>>,
    info: Option<DownstreamInfo>,
    config_schema: Option<Value>,
    spawn_failures: u32,
    next_attempt_at_ms: Option<i64>,
    /// Stderr tail preserved across teardown for the config heuristics.
    last_stderr: Vec<String>,
}

pub struct Supervisor {
    profile: Arc<Profile>,
    paths: Paths,
    health: HealthStore,
    entries: Mutex<HashMap<String, Arc<Mutex<ServerEntry>>>>,
}

impl Supervisor {
    pub fn new(profile: Arc<Profile>, paths: Paths) -> Self {
        let health = HealthStore::load(paths.clone());
        Self {
            profile,
            paths,
            health,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn profile(&self) -> &Arc<Profile> {
        &self.profile
    }

    pub fn server_names(&self) -> Vec<String> {
        self.profile.servers.keys().cloned().collect()
    }

    /// Idempotently bring a server online (spawn + handshake).
    pub async fn start(&self, name: &str) -> PatchbayResult<()> {
        self.ensure_started(name).await.map(|_| ())
    }

    /// Graceful close of one server's transport.
    pub async fn stop(&self, name: &str) {
        if let Some(entry_arc) = self.entries.lock().await.get(name).cloned() {
            let mut entry = entry_arc.lock().await;
            if let Some(transport) = entry.transport.take() {
                entry.last_stderr = transport.recent_stderr();
                transport.shutdown().await;
                info!("server '{}' stopped", name);
            }
        }
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        for name in names {
            self.stop(&name).await;
        }
    }

    /// Dispatch one tool call. Health bookkeeping follows the propagation
    /// policy: only timeouts and transport failures count against the server;
    /// a timeout also tears the connection down so the next dispatch gets a
    /// fresh spawn.
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> PatchbayResult<Value> {
        let transport = self.ensure_started(server).await?;
        let params = json!({"name": tool, "arguments": arguments});
        match transport.request("tools/call", params, timeout).await {
            Ok(value) => {
                self.health.record_success(server);
                Ok(value)
            }
            Err(err) => {
                if err.affects_health() {
                    self.record_failure(server, &err.to_string());
                    self.teardown(server).await;
                }
                if matches!(err, PatchbayError::Unauthorised(_)) {
                    info!(
                        "server '{}' rejected credentials; a refresh may be needed",
                        server
                    );
                }
                Err(err)
            }
        }
    }

    /// Probe one server's catalog: full `tools/list` (following pagination
    /// cursors). A malformed or truncated response is a failure — partial
    /// lists are never ingested.
    pub async fn probe(&self, name: &str) -> PatchbayResult<ServerProbe> {
        let transport = self.ensure_started(name).await?;
        let timeout = Duration::from_secs(self.profile.settings.probe_timeout_secs);

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({"cursor": c}),
                None => json!({}),
            };
            let result = match transport.request("tools/list", params, timeout).await {
                Ok(r) => r,
                Err(err) => {
                    if err.affects_health() {
                        self.record_failure(name, &err.to_string());
                        self.teardown(name).await;
                    }
                    return Err(err);
                }
            };
            match parse_tool_page(&result) {
                Ok((page, next)) => {
                    tools.extend(page);
                    match next {
                        Some(c) => cursor = Some(c),
                        None => break,
                    }
                }
                Err(e) => {
                    let err = PatchbayError::TransportFailure(format!(
                        "malformed tools/list from '{}': {}",
                        name, e
                    ));
                    self.record_failure(name, &err.to_string());
                    self.teardown(name).await;
                    return Err(err);
                }
            }
        }

        self.health.record_success(name);
        let entry_arc = self.entry_for(name).await?;
        let entry = entry_arc.lock().await;
        Ok(ServerProbe {
            info: entry.info.clone().unwrap_or_default(),
            tools,
            config_schema: entry.config_schema.clone(),
        })
    }

    pub fn health_of(&self, name: &str) -> HealthRecord {
        self.health.get(name)
    }

    /// Health of every configured server, including never-probed ones.
    pub fn health_report(&self) -> BTreeMap<String, HealthRecord> {
        self.profile
            .servers
            .keys()
            .map(|name| (name.clone(), self.health.get(name)))
            .collect()
    }

    pub fn mark_healthy(&self, name: &str) {
        self.health.record_success(name);
    }

    pub fn mark_unhealthy(&self, name: &str, error: &str) {
        self.record_failure(name, error);
    }

    /// Manual quarantine control.
    pub fn set_enabled(&self, name: &str, enabled: bool, reason: Option<String>) {
        self.health.set_enabled(name, enabled, reason);
    }

    /// Reset every backoff timer so the next dispatch retries immediately.
    pub async fn force_retry(&self) {
        let map = self.entries.lock().await;
        for entry_arc in map.values() {
            let mut entry = entry_arc.lock().await;
            entry.spawn_failures = 0;
            entry.next_attempt_at_ms = None;
        }
        info!("backoff timers reset");
    }

    /// Configuration hints scraped from the server's recent stderr.
    pub async fn config_hints(&self, name: &str) -> Vec<ConfigHint> {
        if let Some(entry_arc) = self.entries.lock().await.get(name).cloned() {
            let entry = entry_arc.lock().await;
            let lines = match &entry.transport {
                Some(t) => t.recent_stderr(),
                None => entry.last_stderr.clone(),
            };
            return diagnostics::scan_stderr(&lines);
        }
        Vec::new()
    }

    async fn entry_for(&self, name: &str) -> PatchbayResult<Arc<Mutex<ServerEntry>>> {
        if !self.profile.servers.contains_key(name) {
            return Err(PatchbayError::NotFound(format!("server '{}'", name)));
        }
        let mut map = self.entries.lock().await;
        Ok(map
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ServerEntry::default())))
            .clone())
    }

    async fn ensure_started(&self, name: &str) -> PatchbayResult<Arc<Transport>> {
        if self.health.is_disabled(name) {
            return Err(PatchbayError::Quarantined(name.to_string()));
        }
        let config = self
            .profile
            .servers
            .get(name)
            .ok_or_else(|| PatchbayError::NotFound(format!("server '{}'", name)))?
            .clone();

        let entry_arc = self.entry_for(name).await?;
        let mut entry = entry_arc.lock().await;

        if let Some(transport) = &entry.transport {
            if transport.is_closed() {
                entry.last_stderr = transport.recent_stderr();
                entry.transport = None;
            } else {
                return Ok(transport.clone());
            }
        }

        let now = now_ms();
        if let Some(next) = entry.next_attempt_at_ms {
            if now < next {
                return Err(PatchbayError::TransportFailure(format!(
                    "server '{}' backing off for another {}s (force-retry resets)",
                    name,
                    (next - now) / 1000
                )));
            }
        }

        let transport = match &config {
            ServerConfig::Stdio { command, args, env } => {
                let sink = LogSink::new(self.paths.stderr_log(name));
                match StdioTransport::spawn(name, command, args, env, sink) {
                    Ok(t) => Arc::new(Transport::Stdio(t)),
                    Err(e) => {
                        let err = PatchbayError::TransportFailure(format!("spawn failed: {}", e));
                        self.note_attempt_failure(name, &mut entry, &err);
                        return Err(err);
                    }
                }
            }
            ServerConfig::Remote { url, auth } => {
                Arc::new(Transport::Http(HttpTransport::new(name, url, auth.as_ref())))
            }
        };

        let handshake = Duration::from_secs(self.profile.settings.handshake_timeout_secs);
        let init_params = json!({
            "protocolVersion": crate::rpc::PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "patchbay", "version": crate::VERSION},
        });
        match transport.request("initialize", init_params, handshake).await {
            Ok(result) => {
                entry.info = result
                    .get("serverInfo")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<DownstreamInfo>(v).ok());
                entry.config_schema = extract_config_schema(&result);
                if let Err(e) = transport.notify("notifications/initialized", json!({})).await {
                    debug!("initialized notification to '{}' failed: {}", name, e);
                }
                entry.spawn_failures = 0;
                entry.next_attempt_at_ms = None;
                entry.transport = Some(transport.clone());
                debug!("server '{}' online", name);
                Ok(transport)
            }
            Err(err) => {
                entry.last_stderr = transport.recent_stderr();
                transport.shutdown().await;
                self.note_attempt_failure(name, &mut entry, &err);
                Err(err)
            }
        }
    }

    /// Bookkeeping for a failed spawn or handshake: exponential backoff with
    /// jitter, plus health accounting when the failure class warrants it.
    fn note_attempt_failure(&self, name: &str, entry: &mut ServerEntry, err: &PatchbayError) {
        entry.spawn_failures = entry.spawn_failures.saturating_add(1);
        let delay = backoff_delay_secs(entry.spawn_failures, self.profile.settings.backoff_cap_secs);
        entry.next_attempt_at_ms = Some(now_ms() + (delay as i64) * 1000);
        warn!(
            "server '{}' start failed ({}); next attempt in {}s",
            name, err, delay
        );
        if err.affects_health() {
            self.record_failure(name, &err.to_string());
        }
    }

    fn record_failure(&self, name: &str, error: &str) {
        self.health.record_failure(
            name,
            error,
            self.profile.settings.unhealthy_after,
            self.profile.settings.disable_after,
        );
    }

    async fn teardown(&self, name: &str) {
        if let Some(entry_arc) = self.entries.lock().await.get(name).cloned() {
            let mut entry = entry_arc.lock().await;
            if let Some(transport) = entry.transport.take() {
                entry.last_stderr = transport.recent_stderr();
                transport.shutdown().await;
            }
        }
    }
}

/// Exponential backoff with jitter: 1s, 2s, 4s … capped, plus up to 25%.
fn backoff_delay_secs(failures: u32, cap_secs: u64) -> u64 {
    let exp = failures.saturating_sub(1).min(16);
    let base = (1u64 << exp).min(cap_secs);
    let jitter = fastrand::u64(0..=base / 4 + 1);
    (base + jitter).min(cap_secs)
}

fn extract_config_schema(init_result: &Value) -> Option<Value> {
    init_result
        .pointer("/capabilities/experimental/configSchema")
        .or_else(|| init_result.pointer("/capabilities/configSchema"))
        .cloned()
}

fn parse_tool_page(result: &Value) -> anyhow::Result<(Vec<ProbedTool>, Option<String>)> {
    let items = result
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("missing 'tools' array"))?;
    let mut tools = Vec::with_capacity(items.len());
    for item in items {
        let name = item
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("tool entry without a name"))?;
        tools.push(ProbedTool {
            name: name.to_string(),
            description: item
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            input_schema: item
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({"type": "object"})),
            output_schema: item.get("outputSchema").cloned(),
        });
    }
    let next = result
        .get("nextCursor")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    Ok((tools, next))
}
