//! Rule-based score enhancements: domain inference, capability inference and
//! intent resolution.
//!
//! These tables credit tools with skills their descriptions do not spell out
//! (a shell tool can run git even though its description never says so) and
//! map common user phrasings onto candidate operations. All additive; the
//! query pipeline caps the total enhancement so no tool is unilaterally
//! promoted.

/// Cap on the summed enhancement for one tool in one query.
pub const ENHANCEMENT_CAP: f32 = 0.25;

/// Weight of a capability-inference hit: `0.1 × relevance × confidence`.
const CAPABILITY_WEIGHT: f32 = 0.1;

/// Weight of an intent-resolution hit: `0.15 × confidence`.
const INTENT_WEIGHT: f32 = 0.15;

/// Fraction of an intent pattern's keywords that must appear in the query.
const INTENT_MATCH_THRESHOLD: f32 = 0.6;

/// Map a server name to a short domain phrase used in the composed embedding
/// text and for tie-breaking. Unknown servers are `general utility`.
pub fn infer_domain(server_name: &str) -> &'static str {
    let name = server_name.to_ascii_lowercase();
    const TABLE: &[(&[&str], &str)] = &[
        (&["shell", "bash", "terminal", "exec", "command"], "shell command execution"),
        (&["git", "github", "gitlab"], "version control"),
        (&["fs", "file", "filesystem", "disk"], "file system operations"),
        (&["db", "sql", "postgres", "sqlite", "mysql", "database"], "database operations"),
        (&["docs", "doc", "wiki", "knowledge", "notion"], "documentation search"),
        (&["http", "fetch", "web", "browser", "crawl"], "web and http access"),
        (&["mail", "email", "smtp", "slack", "discord", "telegram"], "messaging"),
        (&["calendar", "schedule", "cron"], "calendars and scheduling"),
        (&["search", "index"], "search and retrieval"),
        (&["k8s", "kubernetes", "docker", "container"], "container orchestration"),
        (&["aws", "gcp", "azure", "cloud"], "cloud infrastructure"),
        (&["pay", "stripe", "billing", "invoice"], "payments and billing"),
    ];
    for (needles, domain) in TABLE {
        if needles.iter().any(|n| name.contains(n)) {
            return domain;
        }
    }
    "general utility"
}

/// Tools that take arbitrary commands inherit the capabilities of whatever is
/// on the PATH.
pub fn is_shell_like(tool_name: &str) -> bool {
    let name = tool_name.to_ascii_lowercase();
    ["run_command", "exec", "shell", "bash", "terminal", "execute"]
        .iter()
        .any(|n| name.contains(n))
}

/// Additional text appended to the composed embedding input for tool kinds
/// with implied capabilities. Recorded alongside the embedding so re-indexing
/// is deterministic.
pub fn capability_appendix(tool_name: &str) -> Option<&'static str> {
    if is_shell_like(tool_name) {
        return Some(
            "can run command line programs including git, docker, ffmpeg, make, \
             npm, cargo, pip and other build or deployment tools",
        );
    }
    None
}

struct CapabilityRule {
    /// Query words that imply the capability.
    triggers: &'static [&'static str],
    relevance: f32,
    confidence: f32,
}

const SHELL_CAPABILITIES: &[CapabilityRule] = &[
    CapabilityRule {
        triggers: &["git", "commit", "branch", "rebase", "merge", "clone", "push", "pull"],
        relevance: 0.9,
        confidence: 0.9,
    },
    CapabilityRule {
        triggers: &["docker", "container", "image"],
        relevance: 0.8,
        confidence: 0.8,
    },
    CapabilityRule {
        triggers: &["ffmpeg", "transcode", "video", "audio"],
        relevance: 0.7,
        confidence: 0.7,
    },
    CapabilityRule {
        triggers: &["compile", "build", "make", "npm", "cargo", "pip", "install"],
        relevance: 0.8,
        confidence: 0.8,
    },
];

/// Capability-inference bonus for one tool against one query. Applies only
/// in model-enabled mode (the keyword ranker carries its own category
/// patterns in fallback mode).
pub fn capability_bonus(query_words: &[String], tool_name: &str) -> f32 {
    if !is_shell_like(tool_name) {
        return 0.0;
    }
    let mut bonus = 0.0;
    for rule in SHELL_CAPABILITIES {
        if rule
            .triggers
            .iter()
            .any(|t| query_words.iter().any(|w| w == t))
        {
            bonus += CAPABILITY_WEIGHT * rule.relevance * rule.confidence;
        }
    }
    bonus
}

enum IntentTarget {
    ShellLike,
    ToolNameContains(&'static str),
    DomainIs(&'static str),
}

struct IntentPattern {
    keywords: &'static [&'static str],
    confidence: f32,
    target: IntentTarget,
}

const INTENT_PATTERNS: &[IntentPattern] = &[
    IntentPattern {
        keywords: &["git", "commit"],
        confidence: 0.9,
        target: IntentTarget::ShellLike,
    },
    IntentPattern {
        keywords: &["run", "command"],
        confidence: 0.8,
        target: IntentTarget::ShellLike,
    },
    IntentPattern {
        keywords: &["read", "file"],
        confidence: 0.8,
        target: IntentTarget::ToolNameContains("read"),
    },
    IntentPattern {
        keywords: &["write", "file"],
        confidence: 0.8,
        target: IntentTarget::ToolNameContains("write"),
    },
    IntentPattern {
        keywords: &["delete", "file"],
        confidence: 0.7,
        target: IntentTarget::ToolNameContains("delete"),
    },
    IntentPattern {
        keywords: &["search", "docs"],
        confidence: 0.8,
        target: IntentTarget::DomainIs("documentation search"),
    },
    IntentPattern {
        keywords: &["query", "database"],
        confidence: 0.8,
        target: IntentTarget::DomainIs("database operations"),
    },
    IntentPattern {
        keywords: &["send", "message"],
        confidence: 0.7,
        target: IntentTarget::DomainIs("messaging"),
    },
    IntentPattern {
        keywords: &["fetch", "url"],
        confidence: 0.7,
        target: IntentTarget::DomainIs("web and http access"),
    },
];

/// Intent-resolution bonus: patterns whose keyword majority appears in the
/// query credit their target tools. Applies in both engine modes.
pub fn intent_bonus(query_words: &[String], tool_name: &str, domain: &str) -> f32 {
    let mut bonus = 0.0;
    for pattern in INTENT_PATTERNS {
        let hits = pattern
            .keywords
            .iter()
            .filter(|k| query_words.iter().any(|w| w == *k))
            .count();
        let ratio = hits as f32 / pattern.keywords.len() as f32;
        if ratio < INTENT_MATCH_THRESHOLD {
            continue;
        }
        let applies = match &pattern.target {
            IntentTarget::ShellLike => is_shell_like(tool_name),
            IntentTarget::ToolNameContains(needle) => {
                tool_name.to_ascii_lowercase().contains(needle)
            }
            IntentTarget::DomainIs(wanted) => domain == *wanted,
        };
        if applies {
            bonus += INTENT_WEIGHT * pattern.confidence;
        }
    }
    bonus
}

/// Lowercased word list for matching.
pub fn query_words(query: &str) -> Vec<String> {
    query
        .to_ascii_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// The composed text one tool embedding is produced from.
pub fn compose_text(server: &str, tool: &str, domain: &str, description: &str) -> String {
    let mut text = format!("{}:{} {} context: {}", server, tool, domain, description);
    if let Some(appendix) = capability_appendix(tool) {
        text.push(' ');
        text.push_str(appendix);
    }
    text
}
