//! Shared fixtures for integration tests: a scripted `sh` downstream server
//! and profile files written the way the configuration collaborator would.

use std::path::Path;
use std::sync::Arc;

use patchbay::catalog::Catalog;
use patchbay::config::{Paths, Profile, load_profile};
use patchbay::discovery::DiscoveryEngine;
use patchbay::router::{NoChannel, Router};
use patchbay::supervisor::Supervisor;

/// A well-behaved MCP server as a shell one-liner: answers the handshake and
/// exposes `read_file` and `write_file`.
pub const SCRIPTED_SERVER: &str = r#"while read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"1.0.0"}}}\n' "$id" ;;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"read_file","description":"Read a file from the workspace","inputSchema":{"type":"object","properties":{"path":{"type":"string"}}}},{"name":"write_file","description":"Write or overwrite a file on disk","inputSchema":{"type":"object","properties":{"path":{"type":"string"},"content":{"type":"string"}}}}]}}\n' "$id" ;;
    *'"tools/call"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"ok"}],"isError":false}}\n' "$id" ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"method not found"}}\n' "$id" ;;
  esac
done"#;

/// Write `profiles/<name>.json` with the given stdio servers, each running
/// the scripted fake (or a custom script).
pub fn write_profile(root: &Path, name: &str, servers: &[(&str, &str)]) {
    let mut server_map = serde_json::Map::new();
    for (server_name, script) in servers {
        server_map.insert(
            (*server_name).to_string(),
            serde_json::json!({
                "type": "stdio",
                "command": "sh",
                "args": ["-c", script],
            }),
        );
    }
    let profile = serde_json::json!({"servers": server_map});
    let path = root.join("profiles").join(format!("{}.json", name));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, serde_json::to_string_pretty(&profile).unwrap()).unwrap();
}

pub struct TestStack {
    pub profile: Arc<Profile>,
    pub paths: Paths,
    pub supervisor: Arc<Supervisor>,
    pub catalog: Arc<Catalog>,
    pub discovery: Arc<DiscoveryEngine>,
    pub router: Arc<Router>,
}

/// Build the full component stack over an on-disk profile, keyword-fallback
/// discovery (no model downloads in tests).
pub fn build_stack(root: &Path, profile_name: &str) -> TestStack {
    let paths = Paths::at(root.to_path_buf());
    paths.ensure_layout().unwrap();
    let profile = Arc::new(load_profile(&paths, profile_name).unwrap());
    let supervisor = Arc::new(Supervisor::new(profile.clone(), paths.clone()));
    let catalog = Arc::new(Catalog::new(profile.clone(), paths.clone()));
    let discovery = Arc::new(DiscoveryEngine::without_model(
        profile.settings.clone(),
        paths.clone(),
    ));
    let router = Arc::new(Router::new(
        supervisor.clone(),
        catalog.clone(),
        discovery.clone(),
        Arc::new(NoChannel),
    ));
    TestStack {
        profile,
        paths,
        supervisor,
        catalog,
        discovery,
        router,
    }
}
