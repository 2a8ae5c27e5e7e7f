//! Human-readable rendering of discovery results for the `find` tool.

use serde::{Deserialize, Serialize};
use std::fmt::Write;

use crate::catalog::CatalogSnapshot;
use crate::discovery::Candidate;

/// How much detail `find` emits per result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Names,
    #[default]
    Descriptions,
    Schemas,
}

impl std::str::FromStr for Depth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "names" => Ok(Depth::Names),
            "descriptions" => Ok(Depth::Descriptions),
            "schemas" => Ok(Depth::Schemas),
            other => Err(format!(
                "unknown depth '{}' (expected names, descriptions or schemas)",
                other
            )),
        }
    }
}

/// Render one page of ranked candidates.
pub fn render_results(
    query: &str,
    candidates: &[Candidate],
    snapshot: &CatalogSnapshot,
    depth: Depth,
    page: usize,
    per_page: usize,
) -> String {
    if candidates.is_empty() {
        return format!(
            "No tools matched \"{}\". Try a broader description, or lower the confidence threshold.",
            query
        );
    }

    let pages = candidates.len().div_ceil(per_page).max(1);
    let page = page.clamp(1, pages);
    let start = (page - 1) * per_page;
    let slice = &candidates[start..(start + per_page).min(candidates.len())];

    let mut out = format!(
        "{} tool{} matched \"{}\" (page {}/{})\n",
        candidates.len(),
        if candidates.len() == 1 { "" } else { "s" },
        query,
        page,
        pages
    );
    for (i, candidate) in slice.iter().enumerate() {
        let _ = write!(
            out,
            "\n{:>2}. {}  ({:.0}%)",
            start + i + 1,
            candidate.tool_id,
            candidate.confidence * 100.0
        );
        if depth != Depth::Names {
            let description = if candidate.description.is_empty() {
                "(no description)"
            } else {
                &candidate.description
            };
            let _ = write!(out, "\n    {}", description);
        }
        if depth == Depth::Schemas {
            if let Some(entry) = snapshot.get(&candidate.tool_id) {
                let _ = write!(
                    out,
                    "\n    input: {}",
                    serde_json::to_string(&entry.input_schema).unwrap_or_default()
                );
            }
        }
        out.push('\n');
    }
    let _ = write!(
        out,
        "\nInvoke with: run {{\"tool\": \"<id>\", \"parameters\": {{…}}}}"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ToolEntry;
    use serde_json::json;

    fn candidate(tool_id: &str, confidence: f32) -> Candidate {
        let (server, name) = tool_id.split_once(':').unwrap();
        Candidate {
            tool_id: tool_id.to_string(),
            server: server.to_string(),
            tool_name: name.to_string(),
            description: format!("{} description", name),
            domain: "general utility".to_string(),
            confidence,
        }
    }

    fn snapshot() -> CatalogSnapshot {
        CatalogSnapshot::for_tests(vec![ToolEntry {
            server: "fs".to_string(),
            name: "read".to_string(),
            description: "read description".to_string(),
            input_schema: json!({"type": "object"}),
            output_schema: None,
        }])
    }

    #[test]
    fn empty_results_are_stable_text() {
        let text = render_results("nothing", &[], &snapshot(), Depth::Descriptions, 1, 5);
        assert!(text.contains("No tools matched"));
    }

    #[test]
    fn names_depth_omits_descriptions() {
        let cands = vec![candidate("fs:read", 0.9)];
        let text = render_results("read", &cands, &snapshot(), Depth::Names, 1, 5);
        assert!(text.contains("fs:read"));
        assert!(text.contains("90%"));
        assert!(!text.contains("read description"));
    }

    #[test]
    fn schemas_depth_includes_input_schema() {
        let cands = vec![candidate("fs:read", 0.9)];
        let text = render_results("read", &cands, &snapshot(), Depth::Schemas, 1, 5);
        assert!(text.contains("read description"));
        assert!(text.contains("\"type\":\"object\""));
    }

    #[test]
    fn pagination_slices_and_clamps() {
        let cands: Vec<Candidate> = (0..7)
            .map(|i| candidate(&format!("fs:tool{}", i), 0.9 - i as f32 * 0.05))
            .collect();
        let page2 = render_results("tools", &cands, &snapshot(), Depth::Names, 2, 3);
        assert!(page2.contains("page 2/3"));
        assert!(page2.contains("fs:tool3"));
        assert!(!page2.contains("fs:tool0\n"));

        let clamped = render_results("tools", &cands, &snapshot(), Depth::Names, 99, 3);
        assert!(clamped.contains("page 3/3"));
    }

    #[test]
    fn depth_parses_from_str() {
        assert_eq!("names".parse::<Depth>().unwrap(), Depth::Names);
        assert_eq!("SCHEMAS".parse::<Depth>().unwrap(), Depth::Schemas);
        assert!("full".parse::<Depth>().is_err());
    }
}
