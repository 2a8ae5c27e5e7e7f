//! Modification policy: decide whether a tool call needs confirmation, and
//! the seam confirmation requests go through.
//!
//! A tool is "modifying" when its description lands near a static phrase in
//! embedding space (threshold comes from the profile), or — with no model —
//! when a keyword predicate fires. Confirmation itself is best-effort: the
//! stdio session has no confirmation channel, so the profile's fail-open /
//! fail-closed setting decides what happens to modifying calls.

use async_trait::async_trait;

use crate::discovery::DiscoveryEngine;
use crate::discovery::enhance::is_shell_like;

/// The phrase the modifying predicate measures descriptions against.
pub const MODIFYING_PHRASE: &str =
    "modifies or deletes or writes or sends or creates data or files";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Approved,
    Denied,
    /// No confirmation channel exists; policy decides.
    Unavailable,
}

#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, tool_id: &str, description: &str) -> ConfirmOutcome;
}

/// Used by the stdio session and the scheduler: no round-trip is possible.
pub struct NoChannel;

#[async_trait]
impl Confirmer for NoChannel {
    async fn confirm(&self, _tool_id: &str, _description: &str) -> ConfirmOutcome {
        ConfirmOutcome::Unavailable
    }
}

/// Whether this tool's invocation requires confirmation.
pub async fn is_modifying(
    discovery: &DiscoveryEngine,
    tool_name: &str,
    description: &str,
    threshold: f32,
) -> bool {
    if let Some(similarity) = discovery.similarity(description, MODIFYING_PHRASE).await {
        return similarity >= threshold;
    }
    keyword_predicate(tool_name, description)
}

const MODIFYING_KEYWORDS: &[&str] = &[
    "write", "delete", "remove", "create", "update", "send", "post", "put", "insert", "drop",
    "modify", "overwrite", "move", "rename", "upload",
];

/// Model-free predicate. Shell-like tools can run anything, so they always
/// count as modifying.
pub fn keyword_predicate(tool_name: &str, description: &str) -> bool {
    if is_shell_like(tool_name) {
        return true;
    }
    let name = tool_name.to_ascii_lowercase();
    let desc = description.to_ascii_lowercase();
    MODIFYING_KEYWORDS
        .iter()
        .any(|k| name.contains(k) || desc.contains(k))
}
