//! Instruction parsing seam and plan extraction helpers.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use handrail_core::{LogicalTool, Result, Step, ToolCallRequest};
use handrail_protocol::{ToolCatalog, ToolDescriptor};

use crate::refine::strip_code_fences;

/// Turns a natural-language instruction into an ordered plan of logical
/// steps. Called once per session, before anything executes.
#[async_trait]
pub trait StepParser: Send + Sync {
    async fn parse(&self, instruction: &str, tools: &[ToolDescriptor]) -> Result<Vec<Step>>;
}

/// Function schemas for the logical tools, restricted to those the server's
/// catalog actually maps. The placeholder convention lives in the argument
/// descriptions so the planner knows when to defer a value.
pub fn logical_tool_schemas(catalog: &ToolCatalog) -> Vec<Value> {
    LogicalTool::all()
        .iter()
        .filter(|tool| catalog.remote_name(**tool).is_some())
        .map(|tool| tool_schema(*tool))
        .collect()
}

fn tool_schema(tool: LogicalTool) -> Value {
    let (description, parameters) = match tool {
        LogicalTool::Navigate => (
            "Open a URL in the browser",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "Absolute URL to open"}
                },
                "required": ["url"]
            }),
        ),
        LogicalTool::Click => (
            "Click an element on the current page",
            json!({
                "type": "object",
                "properties": {
                    "ref": {
                        "type": "string",
                        "description": "Element reference from the page snapshot (e.g. s1e5). Use \"UNKNOWN\" if the page has not been seen yet."
                    },
                    "element": {
                        "type": "string",
                        "description": "Human-readable description of the element"
                    }
                },
                "required": ["ref"]
            }),
        ),
        LogicalTool::TypeText => (
            "Type text into an input element",
            json!({
                "type": "object",
                "properties": {
                    "ref": {
                        "type": "string",
                        "description": "Element reference from the page snapshot. Use \"UNKNOWN\" if the page has not been seen yet."
                    },
                    "text": {"type": "string", "description": "Text to type"},
                    "submit": {"type": "boolean", "description": "Press Enter afterwards"}
                },
                "required": ["ref", "text"]
            }),
        ),
        LogicalTool::Scroll => (
            "Scroll the page",
            json!({
                "type": "object",
                "properties": {
                    "direction": {"type": "string", "enum": ["up", "down"]}
                },
                "required": ["direction"]
            }),
        ),
        LogicalTool::Search => (
            "Run a search with the page's search facility",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search query"}
                },
                "required": ["query"]
            }),
        ),
        LogicalTool::AssertText => (
            "Check that text is present on the current page",
            json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string", "description": "Text expected on the page"}
                },
                "required": ["text"]
            }),
        ),
        LogicalTool::DismissDialog => (
            "Dismiss or accept a browser dialog",
            json!({
                "type": "object",
                "properties": {
                    "accept": {"type": "boolean", "description": "Accept instead of dismiss"}
                },
                "required": []
            }),
        ),
        LogicalTool::Snapshot => (
            "Capture the current page state for inspection",
            json!({"type": "object", "properties": {}, "required": []}),
        ),
    };
    json!({
        "type": "function",
        "function": {
            "name": tool.name(),
            "description": description,
            "parameters": parameters
        }
    })
}

/// Map a planner reply's tool calls onto steps. Calls naming tools outside
/// the logical set are skipped with a warning rather than failing the plan.
pub fn steps_from_tool_calls(calls: Vec<ToolCallRequest>) -> Vec<Step> {
    let mut steps = Vec::new();
    for call in calls {
        match LogicalTool::from_name(&call.name) {
            Some(tool) => {
                let arguments = call.arguments.as_object().cloned().unwrap_or_default();
                steps.push(Step::new(tool, arguments));
            }
            None => warn!(tool = %call.name, "Planner requested an unknown tool; skipping"),
        }
    }
    steps
}

#[derive(Deserialize)]
struct PlannedStep {
    tool: String,
    #[serde(default)]
    arguments: Map<String, Value>,
}

/// Fallback extraction for planners that answer with a JSON array in the
/// message content instead of tool calls.
pub fn steps_from_content(content: &str) -> Option<Vec<Step>> {
    let cleaned = strip_code_fences(content);
    let parsed: Vec<PlannedStep> = serde_json::from_str(cleaned).ok()?;
    let steps: Vec<Step> = parsed
        .into_iter()
        .filter_map(|p| LogicalTool::from_name(&p.tool).map(|tool| Step::new(tool, p.arguments)))
        .collect();
    if steps.is_empty() {
        None
    } else {
        Some(steps)
    }
}
