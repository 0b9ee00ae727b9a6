//! LLM-backed implementations of the planning and refinement seams.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use handrail_core::{ChatMessage, Error, LogicalTool, Result, Step};
use handrail_protocol::{ToolCatalog, ToolDescriptor};
use handrail_providers::Provider;

use crate::parser::{logical_tool_schemas, steps_from_content, steps_from_tool_calls, StepParser};
use crate::refine::Refiner;

const PLANNER_SYSTEM_PROMPT: &str = "You turn a user's browser task into an ordered list of tool calls.\n\
Rules:\n\
- Use only the provided tools, one call per step, in execution order.\n\
- Keep the plan minimal; do not add verification steps the user did not ask for.\n\
- Element references come from page snapshots you have not seen yet. When an \
argument needs one, pass the string \"UNKNOWN\" and it will be resolved later.\n\
- Start with a navigate step unless the task says the page is already open.";

const REFINER_SYSTEM_PROMPT: &str = "You fill in placeholder arguments for a browser automation step.\n\
You are given the step's tool, its current arguments, and a snapshot of the \
current page. Replace every \"UNKNOWN\" value using element references from \
the snapshot (the [ref=...] markers).\n\
Reply with ONLY the completed JSON argument object, no prose.";

pub struct LlmPlanner {
    provider: Arc<dyn Provider>,
    max_steps: usize,
}

impl LlmPlanner {
    pub fn new(provider: Arc<dyn Provider>, max_steps: usize) -> Self {
        Self {
            provider,
            max_steps,
        }
    }
}

#[async_trait]
impl StepParser for LlmPlanner {
    async fn parse(&self, instruction: &str, tools: &[ToolDescriptor]) -> Result<Vec<Step>> {
        let catalog = ToolCatalog::resolve(tools);
        let schemas = logical_tool_schemas(&catalog);
        if schemas.is_empty() {
            return Err(Error::Parse(
                "server advertises no usable tools".to_string(),
            ));
        }

        let messages = vec![
            ChatMessage::system(PLANNER_SYSTEM_PROMPT),
            ChatMessage::user(instruction),
        ];
        let response = self.provider.chat(&messages, &schemas).await?;

        let mut steps = steps_from_tool_calls(response.tool_calls);
        if steps.is_empty() {
            if let Some(content) = response.content.as_deref() {
                if let Some(parsed) = steps_from_content(content) {
                    debug!("Plan recovered from message content");
                    steps = parsed;
                }
            }
        }

        if steps.is_empty() {
            return Err(Error::Parse("planner produced no steps".to_string()));
        }
        if steps.len() > self.max_steps {
            warn!(
                planned = steps.len(),
                max = self.max_steps,
                "Plan too long; truncating"
            );
            steps.truncate(self.max_steps);
        }
        Ok(steps)
    }
}

pub struct LlmRefiner {
    provider: Arc<dyn Provider>,
}

impl LlmRefiner {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Refiner for LlmRefiner {
    async fn refine_arguments(
        &self,
        tool: LogicalTool,
        arguments: &Map<String, Value>,
        snapshot_excerpt: &str,
    ) -> Result<String> {
        let prompt = format!(
            "Tool: {}\nCurrent arguments:\n{}\n\nPage snapshot:\n{}\n\nReturn the completed argument object.",
            tool,
            serde_json::to_string_pretty(&Value::Object(arguments.clone()))?,
            snapshot_excerpt
        );
        let messages = vec![
            ChatMessage::system(REFINER_SYSTEM_PROMPT),
            ChatMessage::user(&prompt),
        ];
        let response = self.provider.chat(&messages, &[]).await?;
        response
            .content
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| Error::Refinement("collaborator returned no text".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handrail_core::LLMResponse;
    use handrail_core::ToolCallRequest;
    use serde_json::json;

    struct ScriptedProvider {
        response: std::sync::Mutex<Option<LLMResponse>>,
    }

    impl ScriptedProvider {
        fn new(response: LLMResponse) -> Arc<Self> {
            Arc::new(Self {
                response: std::sync::Mutex::new(Some(response)),
            })
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn chat(&self, _messages: &[ChatMessage], _tools: &[Value]) -> Result<LLMResponse> {
            Ok(self
                .response
                .lock()
                .unwrap()
                .take()
                .unwrap_or_default())
        }
    }

    fn descriptors(names: &[&str]) -> Vec<ToolDescriptor> {
        names
            .iter()
            .map(|n| serde_json::from_value(json!({"name": n})).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_planner_maps_tool_calls() {
        let provider = ScriptedProvider::new(LLMResponse {
            content: None,
            tool_calls: vec![ToolCallRequest {
                id: "c1".to_string(),
                name: "navigate".to_string(),
                arguments: json!({"url": "https://example.com"}),
            }],
            finish_reason: "tool_calls".to_string(),
            usage: Value::Null,
        });
        let planner = LlmPlanner::new(provider, 10);
        let steps = planner
            .parse("open example.com", &descriptors(&["browser_navigate"]))
            .await
            .unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].tool, LogicalTool::Navigate);
    }

    #[tokio::test]
    async fn test_planner_falls_back_to_content_array() {
        let provider = ScriptedProvider::new(LLMResponse {
            content: Some(
                r#"[{"tool": "navigate", "arguments": {"url": "https://example.com"}}]"#
                    .to_string(),
            ),
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
            usage: Value::Null,
        });
        let planner = LlmPlanner::new(provider, 10);
        let steps = planner
            .parse("open example.com", &descriptors(&["browser_navigate"]))
            .await
            .unwrap();
        assert_eq!(steps.len(), 1);
    }

    #[tokio::test]
    async fn test_planner_empty_reply_is_parse_error() {
        let provider = ScriptedProvider::new(LLMResponse {
            content: Some("I cannot help with that.".to_string()),
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
            usage: Value::Null,
        });
        let planner = LlmPlanner::new(provider, 10);
        let err = planner
            .parse("do nothing", &descriptors(&["browser_navigate"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[tokio::test]
    async fn test_planner_truncates_oversized_plans() {
        let calls: Vec<ToolCallRequest> = (0..14)
            .map(|i| ToolCallRequest {
                id: format!("c{}", i),
                name: "click".to_string(),
                arguments: json!({"ref": "UNKNOWN"}),
            })
            .collect();
        let provider = ScriptedProvider::new(LLMResponse {
            content: None,
            tool_calls: calls,
            finish_reason: "tool_calls".to_string(),
            usage: Value::Null,
        });
        let planner = LlmPlanner::new(provider, 10);
        let steps = planner
            .parse("click everything", &descriptors(&["browser_click"]))
            .await
            .unwrap();
        assert_eq!(steps.len(), 10);
    }

    #[tokio::test]
    async fn test_refiner_returns_reply_text() {
        let provider = ScriptedProvider::new(LLMResponse {
            content: Some(r#"{"ref":"s1e2"}"#.to_string()),
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
            usage: Value::Null,
        });
        let refiner = LlmRefiner::new(provider);
        let reply = refiner
            .refine_arguments(LogicalTool::Click, &Map::new(), "Page Snapshot")
            .await
            .unwrap();
        assert_eq!(reply, r#"{"ref":"s1e2"}"#);
    }
}
