//! Refinement bridge: resolving placeholder arguments from page state.
//!
//! Steps planned before the page is known carry `"UNKNOWN"` argument
//! values. The bridge hands the step and a bounded snapshot excerpt to a
//! collaborator and replaces the arguments with whatever it returns, after
//! validating the reply.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use handrail_core::{Error, LogicalTool, Result, Step, UNKNOWN};

/// Snapshot excerpts never exceed this many characters.
pub const SNAPSHOT_EXCERPT_MAX: usize = 10_000;
const EXCERPT_HEAD: usize = 6_000;
const EXCERPT_TAIL: usize = 4_000;

/// The collaborator that resolves placeholder arguments. Production wires
/// an LLM; tests script replies.
#[async_trait]
pub trait Refiner: Send + Sync {
    async fn refine_arguments(
        &self,
        tool: LogicalTool,
        arguments: &Map<String, Value>,
        snapshot_excerpt: &str,
    ) -> Result<String>;
}

#[derive(Clone)]
pub struct RefinementBridge {
    refiner: Arc<dyn Refiner>,
}

impl RefinementBridge {
    pub fn new(refiner: Arc<dyn Refiner>) -> Self {
        Self { refiner }
    }

    /// Resolve a step's arguments against the given snapshot. A step with
    /// no placeholders passes through untouched and the collaborator is
    /// never consulted.
    pub async fn refine(&self, step: &Step, snapshot: &str) -> Result<Map<String, Value>> {
        if !step.needs_refinement() {
            return Ok(step.arguments.clone());
        }
        let excerpt = excerpt(snapshot);
        let reply = self
            .refiner
            .refine_arguments(step.tool, &step.arguments, &excerpt)
            .await?;
        parse_refined(&reply)
    }
}

/// Bound a snapshot to [`SNAPSHOT_EXCERPT_MAX`] characters, keeping the head
/// (page header, URL, top of the tree) and the tail (where recent content
/// usually sits) with an elision marker between them.
pub fn excerpt(snapshot: &str) -> String {
    let total = snapshot.chars().count();
    if total <= SNAPSHOT_EXCERPT_MAX {
        return snapshot.to_string();
    }
    let head: String = snapshot.chars().take(EXCERPT_HEAD).collect();
    let tail: String = snapshot.chars().skip(total - EXCERPT_TAIL).collect();
    format!(
        "{}\n[... {} characters elided ...]\n{}",
        head,
        total - EXCERPT_HEAD - EXCERPT_TAIL,
        tail
    )
}

/// Validate a collaborator reply: code fences tolerated, must parse to a
/// JSON object, must not still contain placeholders.
pub fn parse_refined(reply: &str) -> Result<Map<String, Value>> {
    let cleaned = strip_code_fences(reply);
    let value: Value = serde_json::from_str(cleaned)
        .map_err(|e| Error::Refinement(format!("reply is not valid JSON: {}", e)))?;
    let Value::Object(map) = value else {
        return Err(Error::Refinement("reply is not a JSON object".to_string()));
    };
    if map.values().any(|v| v.as_str() == Some(UNKNOWN)) {
        return Err(Error::Refinement(
            "refined arguments still contain UNKNOWN".to_string(),
        ));
    }
    Ok(map)
}

pub(crate) fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed);
    trimmed.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct ScriptedRefiner {
        reply: String,
        calls: std::sync::Mutex<u32>,
    }

    #[async_trait]
    impl Refiner for ScriptedRefiner {
        async fn refine_arguments(
            &self,
            _tool: LogicalTool,
            _arguments: &Map<String, Value>,
            _snapshot_excerpt: &str,
        ) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.reply.clone())
        }
    }

    fn bridge(reply: &str) -> (RefinementBridge, Arc<ScriptedRefiner>) {
        let refiner = Arc::new(ScriptedRefiner {
            reply: reply.to_string(),
            calls: std::sync::Mutex::new(0),
        });
        (RefinementBridge::new(refiner.clone()), refiner)
    }

    fn args(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn test_fully_specified_step_passes_through() {
        let (bridge, refiner) = bridge(r#"{"ref":"never used"}"#);
        let step = Step::new(LogicalTool::Click, args(&[("ref", "s1e4")]));
        let refined = bridge.refine(&step, "ignored").await.unwrap();
        assert_eq!(refined, step.arguments);
        assert_eq!(*refiner.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_placeholder_replaced_from_reply() {
        let (bridge, refiner) = bridge(r#"{"ref":"s2e7"}"#);
        let step = Step::new(LogicalTool::Click, args(&[("ref", UNKNOWN)]));
        let refined = bridge.refine(&step, "Page Snapshot").await.unwrap();
        assert_eq!(refined.get("ref"), Some(&json!("s2e7")));
        assert_eq!(*refiner.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fenced_reply_tolerated() {
        let (bridge, _) = bridge("```json\n{\"ref\":\"s3e1\"}\n```");
        let step = Step::new(LogicalTool::Click, args(&[("ref", UNKNOWN)]));
        let refined = bridge.refine(&step, "snap").await.unwrap();
        assert_eq!(refined.get("ref"), Some(&json!("s3e1")));
    }

    #[tokio::test]
    async fn test_residual_placeholder_is_an_error() {
        let (bridge, _) = bridge(r#"{"ref":"UNKNOWN"}"#);
        let step = Step::new(LogicalTool::Click, args(&[("ref", UNKNOWN)]));
        let err = bridge.refine(&step, "snap").await.unwrap_err();
        assert!(matches!(err, Error::Refinement(_)));
    }

    #[tokio::test]
    async fn test_non_object_reply_is_an_error() {
        let (bridge, _) = bridge(r#"["not", "an", "object"]"#);
        let step = Step::new(LogicalTool::Click, args(&[("ref", UNKNOWN)]));
        assert!(bridge.refine(&step, "snap").await.is_err());
    }

    #[test]
    fn test_parse_refined_rejects_prose() {
        assert!(parse_refined("I could not find the element").is_err());
    }

    #[test]
    fn test_short_snapshot_untouched() {
        let snap = "Page URL: https://example.com";
        assert_eq!(excerpt(snap), snap);
    }

    #[test]
    fn test_long_snapshot_keeps_head_and_tail() {
        let snap: String = "a".repeat(6_000) + &"b".repeat(9_000) + &"c".repeat(4_000);
        let bounded = excerpt(&snap);
        assert!(bounded.starts_with(&"a".repeat(100)));
        assert!(bounded.ends_with(&"c".repeat(100)));
        assert!(bounded.contains("9000 characters elided"));
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        // Multibyte characters must not be split.
        let snap: String = "é".repeat(12_000);
        let bounded = excerpt(&snap);
        assert!(bounded.contains("2000 characters elided"));
        assert!(bounded.chars().all(|c| c == 'é' || c.is_ascii()));
    }
}
