//! Heuristic scan of captured stderr for configuration problems.
//!
//! Servers that die because of a missing API key or an uninstalled package
//! rarely say so over the protocol. When a server has no machine-readable
//! configuration schema, this scan gives the repair UI something to ask for.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigHint {
    /// Server needs a credential; the env var name if it said which.
    MissingCredential { env_var: Option<String> },
    /// The configured command or a package it needs is not installed.
    MissingDependency { detail: String },
}

impl std::fmt::Display for ConfigHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigHint::MissingCredential { env_var: Some(var) } => {
                write!(f, "missing credential: set {}", var)
            }
            ConfigHint::MissingCredential { env_var: None } => {
                write!(f, "missing credential (API key)")
            }
            ConfigHint::MissingDependency { detail } => {
                write!(f, "missing dependency: {}", detail)
            }
        }
    }
}

fn env_var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:environment variable|env var|set)\s+([A-Z][A-Z0-9_]{2,})\b")
            .expect("static regex")
    })
}

fn api_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(missing|invalid|no)\s+(api[ _-]?key|token|credentials?)").expect("static regex")
    })
}

fn not_found_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(command not found|no such file|cannot find (module|package)|module not found|package .* not found)")
            .expect("static regex")
    })
}

/// Scan captured stderr lines for configuration hints. Deduplicated,
/// first-seen order.
pub fn scan_stderr(lines: &[String]) -> Vec<ConfigHint> {
    let mut hints: Vec<ConfigHint> = Vec::new();
    for line in lines {
        if let Some(caps) = env_var_regex().captures(line) {
            let hint = ConfigHint::MissingCredential {
                env_var: caps.get(1).map(|m| m.as_str().to_string()),
            };
            if !hints.contains(&hint) {
                hints.push(hint);
            }
            continue;
        }
        if api_key_regex().is_match(line) {
            let hint = ConfigHint::MissingCredential { env_var: None };
            if !hints.contains(&hint) {
                hints.push(hint);
            }
            continue;
        }
        if not_found_regex().is_match(line) {
            let hint = ConfigHint::MissingDependency {
                detail: line.trim().chars().take(120).collect(),
            };
            if !hints.contains(&hint) {
                hints.push(hint);
            }
        }
    }
    hints
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(input: &[&str]) -> Vec<String> {
        input.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn detects_named_env_var() {
        let hints = scan_stderr(&lines(&["Error: environment variable GITHUB_TOKEN required"]));
        assert_eq!(
            hints,
            vec![ConfigHint::MissingCredential {
                env_var: Some("GITHUB_TOKEN".to_string())
            }]
        );
    }

    #[test]
    fn detects_generic_api_key() {
        let hints = scan_stderr(&lines(&["fatal: missing API key for service"]));
        assert_eq!(hints, vec![ConfigHint::MissingCredential { env_var: None }]);
    }

    #[test]
    fn detects_missing_package() {
        let hints = scan_stderr(&lines(&["sh: npx: command not found"]));
        assert!(matches!(hints[0], ConfigHint::MissingDependency { .. }));
    }

    #[test]
    fn deduplicates_repeated_hints() {
        let hints = scan_stderr(&lines(&[
            "missing api key",
            "still missing API key",
            "retrying...",
        ]));
        assert_eq!(hints.len(), 1);
    }

    #[test]
    fn clean_stderr_yields_nothing() {
        let hints = scan_stderr(&lines(&["server listening", "ready"]));
        assert!(hints.is_empty());
    }
}
