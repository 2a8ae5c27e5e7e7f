//! Fallback keyword ranker, used for every query when the embedding model is
//! unavailable. Weighted term counts against tool name (×2) and description,
//! with synonym expansion and category patterns; output is normalised into
//! [0, 1] so the pipeline shape matches the vector path.

use super::enhance::is_shell_like;

/// Static synonym table: a query term also matches any of its expansions.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("save", &["write", "create", "store"]),
    ("show", &["view", "display", "read", "get", "list"]),
    ("find", &["search", "query", "lookup", "locate"]),
    ("delete", &["remove", "drop", "destroy"]),
    ("make", &["create", "new", "generate"]),
    ("edit", &["update", "modify", "change", "patch"]),
    ("fetch", &["get", "download", "retrieve", "request"]),
    ("send", &["post", "publish", "deliver", "message"]),
    ("open", &["read", "load", "view"]),
    ("run", &["execute", "exec", "start", "launch"]),
];

/// Query categories that imply a tool kind the terms themselves never name.
const CATEGORY_PATTERNS: &[(&[&str], Category)] = &[
    (
        &["git", "docker", "compile", "build", "ffmpeg", "npm", "cargo", "terminal", "command"],
        Category::ShellLike,
    ),
    (&["file", "folder", "directory", "path"], Category::NameContains("file")),
    (&["sql", "database", "table", "rows"], Category::DescriptionContains("database")),
];

enum Category {
    ShellLike,
    NameContains(&'static str),
    DescriptionContains(&'static str),
}

const NAME_WEIGHT: f32 = 2.0;
const DESCRIPTION_WEIGHT: f32 = 1.0;
const CATEGORY_WEIGHT: f32 = 2.0;
/// Highest score one query term can contribute (name + description hit).
const MAX_PER_TERM: f32 = NAME_WEIGHT + DESCRIPTION_WEIGHT;

fn expansions(term: &str) -> Vec<&str> {
    let mut out = vec![term];
    for (word, syns) in SYNONYMS {
        if *word == term {
            out.extend_from_slice(syns);
        }
    }
    out
}

/// Score one tool for one query. Deterministic; [0, 1].
pub fn score(query_words: &[String], tool_name: &str, description: &str) -> f32 {
    if query_words.is_empty() {
        return 0.0;
    }
    let name = tool_name.to_ascii_lowercase();
    let desc = description.to_ascii_lowercase();

    let mut raw = 0.0;
    for term in query_words {
        let candidates = expansions(term);
        if candidates.iter().any(|t| name.contains(t)) {
            raw += NAME_WEIGHT;
        }
        if candidates.iter().any(|t| desc.contains(t)) {
            raw += DESCRIPTION_WEIGHT;
        }
    }

    for (triggers, category) in CATEGORY_PATTERNS {
        if !triggers.iter().any(|t| query_words.iter().any(|w| w == t)) {
            continue;
        }
        let applies = match category {
            Category::ShellLike => is_shell_like(tool_name),
            Category::NameContains(needle) => name.contains(needle),
            Category::DescriptionContains(needle) => desc.contains(needle),
        };
        if applies {
            raw += CATEGORY_WEIGHT;
        }
    }

    (raw / (query_words.len() as f32 * MAX_PER_TERM)).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::enhance::query_words;

    #[test]
    fn exact_name_match_scores_highest() {
        let words = query_words("read file");
        let read = score(&words, "read_file", "Read a file from disk");
        let write = score(&words, "write_file", "Write a file to disk");
        assert!(read > write);
        assert!(read > 0.5);
    }

    #[test]
    fn synonym_expansion_matches() {
        let words = query_words("save my notes");
        let s = score(&words, "write_file", "Write or create a file");
        assert!(s > 0.0, "save should expand to write/create");
    }

    #[test]
    fn category_pattern_credits_shell_for_git() {
        let words = query_words("git commit");
        let shell = score(&words, "run_command", "Execute a command");
        let docs = score(&words, "search", "Search documentation");
        assert!(shell > docs);
        assert_eq!(docs, 0.0);
    }

    #[test]
    fn empty_query_scores_zero() {
        assert_eq!(score(&[], "read_file", "Read a file"), 0.0);
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        let words = query_words("run command terminal git docker build");
        let s = score(&words, "run_command_exec_shell", "Execute run command shell terminal");
        assert!((0.0..=1.0).contains(&s));
    }
}
