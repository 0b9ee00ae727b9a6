//! Flattening of tools/call result payloads.
//!
//! Results arrive as a content array of typed items plus an isError flag.
//! Text items are joined for display; any item that looks like a page-state
//! dump is additionally surfaced as a snapshot so the orchestrator can hold
//! it for refinement.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Element references in accessibility dumps look like `link "Docs" [ref=s1e4]`.
static REF_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[ref=[^\]]+\]").unwrap());

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// All text items joined with newlines.
    pub text: String,
    /// The first text item that looked like a page-state dump, verbatim.
    pub snapshot: Option<String>,
    /// Tool-level failure flag reported by the server.
    pub is_error: bool,
}

pub fn looks_like_snapshot(text: &str) -> bool {
    text.contains("Page URL:") || text.contains("Page Snapshot") || REF_MARKER.is_match(text)
}

pub fn parse_tool_result(result: &Value) -> ToolOutput {
    let is_error = result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut text_parts = Vec::new();
    let mut snapshot = None;

    if let Some(items) = result.get("content").and_then(|c| c.as_array()) {
        for item in items {
            if item.get("type").and_then(|t| t.as_str()) != Some("text") {
                continue;
            }
            let Some(text) = item.get("text").and_then(|t| t.as_str()) else {
                continue;
            };
            if snapshot.is_none() && looks_like_snapshot(text) {
                snapshot = Some(text.to_string());
            }
            text_parts.push(text.to_string());
        }
    }

    ToolOutput {
        text: text_parts.join("\n"),
        snapshot,
        is_error,
    }
}
