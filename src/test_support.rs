//! Shared fixtures for unit tests: scripted downstream servers built from
//! `sh` one-liners, so no real MCP server binary is needed.

use std::collections::BTreeMap;

use crate::config::{Profile, ServerConfig};

/// A well-behaved downstream server: answers the handshake and exposes
/// `read_file` and `write_file`. Replies echo the request id, which the shell
/// extracts from the wire frame.
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

pub fn scripted_server() -> ServerConfig {
    sh_server(SCRIPTED_SERVER)
}

/// A server that never answers anything.
pub fn silent_server() -> ServerConfig {
    sh_server("sleep 60")
}

pub fn sh_server(script: &str) -> ServerConfig {
    ServerConfig::Stdio {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: BTreeMap::new(),
    }
}

pub fn profile_with(servers: Vec<(&str, ServerConfig)>) -> Profile {
    let mut profile = Profile {
        name: "test".to_string(),
        ..Profile::default()
    };
    for (name, config) in servers {
        profile.servers.insert(name.to_string(), config);
    }
    profile
}
