//! Persistent form of the catalog: a structured JSON document plus a
//! line-oriented CSV index for fast cold-start listing.
//!
//! Both files are written atomically and always as a pair; readers tolerate
//! either being missing by treating the cache as empty.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use super::{CatalogSnapshot, ToolEntry};
use crate::config::Paths;
use crate::supervisor::DownstreamInfo;
use crate::utils::{atomic_write, now_ms};

pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheMetadata {
    #[serde(default)]
    pub version: u32,
    #[serde(rename = "createdAtMs", default)]
    pub created_at_ms: i64,
    #[serde(rename = "configHash", default)]
    pub config_hash: String,
    #[serde(rename = "perServerHash", default)]
    pub per_server_hash: BTreeMap<String, String>,
    #[serde(rename = "totalTools", default)]
    pub total_tools: usize,
}

impl CacheMetadata {
    pub fn older_than_days(&self, days: u32) -> bool {
        let age_ms = now_ms() - self.created_at_ms;
        age_ms > i64::from(days) * 24 * 60 * 60 * 1000
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheDocument {
    metadata: CacheMetadata,
    servers: BTreeMap<String, ServerSlice>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerSlice {
    #[serde(default)]
    info: DownstreamInfo,
    #[serde(rename = "configSchema", skip_serializing_if = "Option::is_none")]
    config_schema: Option<Value>,
    #[serde(default)]
    tools: Vec<CachedTool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "inputSchema", default)]
    input_schema: Value,
    #[serde(rename = "outputSchema", skip_serializing_if = "Option::is_none")]
    output_schema: Option<Value>,
}

/// Load the persisted catalog, or None when absent/unreadable. Staleness is
/// the caller's judgement; this only restores the bytes.
pub fn load(paths: &Paths) -> Option<CatalogSnapshot> {
    let raw = std::fs::read_to_string(paths.all_tools_json()).ok()?;
    let doc: CacheDocument = match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("discarding unreadable tool cache: {}", e);
            return None;
        }
    };

    let mut tools = Vec::with_capacity(doc.metadata.total_tools);
    let mut server_info = BTreeMap::new();
    let mut config_schemas = BTreeMap::new();
    for (server, slice) in doc.servers {
        server_info.insert(server.clone(), slice.info);
        if let Some(schema) = slice.config_schema {
            config_schemas.insert(server.clone(), schema);
        }
        for tool in slice.tools {
            tools.push(ToolEntry {
                server: server.clone(),
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
                output_schema: tool.output_schema,
            });
        }
    }
    Some(CatalogSnapshot::build(
        tools,
        server_info,
        config_schemas,
        doc.metadata,
    ))
}

/// Write the JSON and CSV forms as an atomic pair.
pub fn persist(paths: &Paths, snapshot: &CatalogSnapshot) -> Result<()> {
    let mut servers: BTreeMap<String, ServerSlice> = BTreeMap::new();
    for (server, info) in &snapshot.server_info {
        servers.insert(
            server.clone(),
            ServerSlice {
                info: info.clone(),
                config_schema: snapshot.config_schemas.get(server).cloned(),
                tools: Vec::new(),
            },
        );
    }
    for tool in snapshot.all_tools() {
        let slice = servers
            .entry(tool.server.clone())
            .or_insert_with(|| ServerSlice {
                info: DownstreamInfo::default(),
                config_schema: None,
                tools: Vec::new(),
            });
        slice.tools.push(CachedTool {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
            output_schema: tool.output_schema.clone(),
        });
    }

    let doc = CacheDocument {
        metadata: snapshot.metadata.clone(),
        servers,
    };
    let json = serde_json::to_string_pretty(&doc).context("serializing tool cache")?;
    atomic_write(&paths.all_tools_json(), &json)?;

    let mut csv = String::from("server,tool,description\n");
    for tool in snapshot.all_tools() {
        csv.push_str(&csv_escape(&tool.server));
        csv.push(',');
        csv.push_str(&csv_escape(&tool.name));
        csv.push(',');
        csv.push_str(&csv_escape(&tool.description));
        csv.push('\n');
    }
    atomic_write(&paths.all_tools_csv(), &csv)?;
    Ok(())
}

/// Quote a CSV field when it needs it; inner quotes are doubled.
pub fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Parse the CSV index back into `(server, tool, description)` rows — the
/// fast cold-start listing that skips JSON entirely.
pub fn read_csv_index(paths: &Paths) -> Vec<(String, String, String)> {
    let Ok(raw) = std::fs::read_to_string(paths.all_tools_csv()) else {
        return Vec::new();
    };
    let mut rows = Vec::new();
    for line in raw.lines().skip(1) {
        let fields = split_csv_line(line);
        if fields.len() == 3 {
            rows.push((fields[0].clone(), fields[1].clone(), fields[2].clone()));
        }
    }
    rows
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }
    fields.push(current);
    fields
}
