use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named set of downstream server configurations, served as one unit.
/// A running patchbay instance serves exactly one profile.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    /// BTreeMap keeps server order stable for content hashing.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub settings: Settings,
}

/// One downstream tool server. Subprocess servers are spawned and spoken to
/// over stdio; remote servers are HTTP endpoints with an optional SSE
/// response stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Remote {
        url: String,
        #[serde(default)]
        auth: Option<AuthSpec>,
    },
}

/// How to authenticate against a remote server. The secret itself lives with
/// the credentials collaborator; we only carry the scheme and the name of the
/// environment variable the resolved token is handed over in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSpec {
    /// "bearer", "basic" or "oauth".
    pub scheme: String,
    #[serde(rename = "tokenEnv", default)]
    pub token_env: Option<String>,
}

impl AuthSpec {
    /// Resolve the token from the configured environment variable, if any.
    pub fn resolve_token(&self) -> Option<String> {
        self.token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty())
    }
}

impl Profile {
    /// Sanity-check a collaborator-supplied profile before serving it.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, config) in &self.servers {
            match config {
                ServerConfig::Stdio { command, .. } => {
                    if command.trim().is_empty() {
                        anyhow::bail!("server '{}': command is empty", name);
                    }
                }
                ServerConfig::Remote { url, auth } => {
                    let parsed = url::Url::parse(url).map_err(|e| {
                        anyhow::anyhow!("server '{}': invalid url '{}': {}", name, url, e)
                    })?;
                    if !matches!(parsed.scheme(), "http" | "https") {
                        anyhow::bail!(
                            "server '{}': url scheme must be http or https, got '{}'",
                            name,
                            parsed.scheme()
                        );
                    }
                    if let Some(auth) = auth {
                        if !matches!(auth.scheme.as_str(), "bearer" | "basic" | "oauth") {
                            anyhow::bail!(
                                "server '{}': unknown auth scheme '{}'",
                                name,
                                auth.scheme
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Profile-level tunables. Every field has a serde default so profiles only
/// spell out what they change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Handshake deadline for initialize + tools/list, seconds.
    #[serde(rename = "handshakeTimeoutSecs", default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Default per-call deadline for discovery probes, seconds.
    #[serde(rename = "probeTimeoutSecs", default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Default per-call deadline for tool dispatch and job executions, seconds.
    #[serde(rename = "callTimeoutSecs", default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Consecutive errors before a server is marked unhealthy.
    #[serde(rename = "unhealthyAfter", default = "default_unhealthy_after")]
    pub unhealthy_after: u32,
    /// Cumulative errors before a server is quarantined (disabled).
    #[serde(rename = "disableAfter", default = "default_disable_after")]
    pub disable_after: u32,
    /// Cap on the exponential retry backoff, seconds.
    #[serde(rename = "backoffCapSecs", default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// Catalog/embedding cache entries older than this are rebuilt.
    #[serde(rename = "cacheMaxAgeDays", default = "default_cache_max_age")]
    pub cache_max_age_days: u32,
    /// Minimum confidence for discovery results.
    #[serde(rename = "minConfidence", default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Embedding-similarity threshold for the "modifying tool" predicate.
    #[serde(rename = "confirmThreshold", default = "default_confirm_threshold")]
    pub confirm_threshold: f32,
    /// With no confirmation channel available: true denies modifying calls,
    /// false lets them proceed.
    #[serde(rename = "confirmFailClosed", default)]
    pub confirm_fail_closed: bool,
    #[serde(rename = "embeddingModel", default = "default_embedding_model")]
    pub embedding_model: String,
}

fn default_handshake_timeout() -> u64 {
    8
}

fn default_probe_timeout() -> u64 {
    8
}

fn default_call_timeout() -> u64 {
    300
}

fn default_unhealthy_after() -> u32 {
    3
}

fn default_disable_after() -> u32 {
    5
}

fn default_backoff_cap() -> u64 {
    1800
}

fn default_cache_max_age() -> u32 {
    7
}

fn default_min_confidence() -> f32 {
    0.3
}

fn default_confirm_threshold() -> f32 {
    0.6
}

fn default_embedding_model() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("settings defaults are total")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults() {
        let s = Settings::default();
        assert_eq!(s.handshake_timeout_secs, 8);
        assert_eq!(s.unhealthy_after, 3);
        assert_eq!(s.disable_after, 5);
        assert_eq!(s.backoff_cap_secs, 1800);
        assert_eq!(s.cache_max_age_days, 7);
        assert!((s.min_confidence - 0.3).abs() < f32::EPSILON);
        assert!(!s.confirm_fail_closed);
    }

    #[test]
    fn server_config_tagged_deserialization() {
        let stdio: ServerConfig = serde_json::from_str(
            r#"{"type":"stdio","command":"npx","args":["-y","@modelcontextprotocol/server-filesystem"]}"#,
        )
        .unwrap();
        assert!(matches!(stdio, ServerConfig::Stdio { .. }));

        let remote: ServerConfig = serde_json::from_str(
            r#"{"type":"remote","url":"https://tools.example.com/mcp","auth":{"scheme":"bearer","tokenEnv":"EXAMPLE_TOKEN"}}"#,
        )
        .unwrap();
        match remote {
            ServerConfig::Remote { url, auth } => {
                assert_eq!(url, "https://tools.example.com/mcp");
                assert_eq!(auth.unwrap().scheme, "bearer");
            }
            ServerConfig::Stdio { .. } => panic!("expected remote"),
        }
    }

    #[test]
    fn profile_deserializes_with_partial_settings() {
        let profile: Profile = serde_json::from_str(
            r#"{"name":"work","servers":{},"settings":{"confirmFailClosed":true}}"#,
        )
        .unwrap();
        assert!(profile.settings.confirm_fail_closed);
        assert_eq!(profile.settings.handshake_timeout_secs, 8);
    }

    #[test]
    fn validate_rejects_bad_remote_urls() {
        let mut profile = Profile::default();
        profile.servers.insert(
            "bad".to_string(),
            ServerConfig::Remote {
                url: "ftp://tools.example.com".to_string(),
                auth: None,
            },
        );
        assert!(profile.validate().is_err());

        profile.servers.insert(
            "bad".to_string(),
            ServerConfig::Remote {
                url: "https://tools.example.com/mcp".to_string(),
                auth: Some(AuthSpec {
                    scheme: "bearer".to_string(),
                    token_env: None,
                }),
            },
        );
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_command_and_unknown_auth() {
        let mut profile = Profile::default();
        profile.servers.insert(
            "blank".to_string(),
            ServerConfig::Stdio {
                command: "  ".to_string(),
                args: vec![],
                env: BTreeMap::new(),
            },
        );
        assert!(profile.validate().is_err());

        let mut profile = Profile::default();
        profile.servers.insert(
            "odd".to_string(),
            ServerConfig::Remote {
                url: "https://x.example.com".to_string(),
                auth: Some(AuthSpec {
                    scheme: "kerberos".to_string(),
                    token_env: None,
                }),
            },
        );
        assert!(profile.validate().is_err());
    }

    #[test]
    fn auth_token_resolution_from_env() {
        unsafe { std::env::set_var("PATCHBAY_TEST_TOKEN", "sekrit") };
        let auth = AuthSpec {
            scheme: "bearer".to_string(),
            token_env: Some("PATCHBAY_TEST_TOKEN".to_string()),
        };
        assert_eq!(auth.resolve_token().as_deref(), Some("sekrit"));
        unsafe { std::env::remove_var("PATCHBAY_TEST_TOKEN") };
        assert_eq!(auth.resolve_token(), None);
    }
}
