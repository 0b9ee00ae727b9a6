use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Placeholder argument value meaning "resolve from page state before execution".
pub const UNKNOWN: &str = "UNKNOWN";

/// Abstract browser operations the planner may emit.
///
/// These names are stable within handrail; the catalog resolver maps each to
/// whatever concrete tool name the automation server advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalTool {
    Navigate,
    Click,
    TypeText,
    Scroll,
    Search,
    AssertText,
    DismissDialog,
    Snapshot,
}

impl LogicalTool {
    pub fn all() -> &'static [LogicalTool] {
        &[
            LogicalTool::Navigate,
            LogicalTool::Click,
            LogicalTool::TypeText,
            LogicalTool::Scroll,
            LogicalTool::Search,
            LogicalTool::AssertText,
            LogicalTool::DismissDialog,
            LogicalTool::Snapshot,
        ]
    }

    /// Stable lowercase name used in plans, prompts, and status payloads.
    pub fn name(&self) -> &'static str {
        match self {
            LogicalTool::Navigate => "navigate",
            LogicalTool::Click => "click",
            LogicalTool::TypeText => "type_text",
            LogicalTool::Scroll => "scroll",
            LogicalTool::Search => "search",
            LogicalTool::AssertText => "assert_text",
            LogicalTool::DismissDialog => "dismiss_dialog",
            LogicalTool::Snapshot => "snapshot",
        }
    }

    /// Substring an advertised remote tool name must contain to satisfy
    /// this operation.
    pub fn keyword(&self) -> &'static str {
        match self {
            LogicalTool::Navigate => "navigate",
            LogicalTool::Click => "click",
            LogicalTool::TypeText => "type",
            LogicalTool::Scroll => "scroll",
            LogicalTool::Search => "search",
            LogicalTool::AssertText => "assert",
            LogicalTool::DismissDialog => "dialog",
            LogicalTool::Snapshot => "snapshot",
        }
    }

    pub fn from_name(name: &str) -> Option<LogicalTool> {
        LogicalTool::all().iter().copied().find(|t| t.name() == name)
    }

    /// Pure state-capture actions: skipped by the sequencer, never shown
    /// for confirmation, executed only to refresh the page snapshot.
    pub fn is_diagnostic(&self) -> bool {
        matches!(self, LogicalTool::Snapshot)
    }
}

impl std::fmt::Display for LogicalTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One planned action. Arguments are mutated exactly once, when refinement
/// replaces the whole map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub tool: LogicalTool,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl Step {
    pub fn new(tool: LogicalTool, arguments: Map<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool,
            arguments,
        }
    }

    /// True iff any argument still carries the `UNKNOWN` sentinel.
    pub fn needs_refinement(&self) -> bool {
        self.arguments.values().any(|v| v.as_str() == Some(UNKNOWN))
    }
}

/// Step projection for confirmation and status surfaces. Carries the step id
/// so UI correlation works even though diagnostic steps are filtered out of
/// the lists it appears in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    pub id: String,
    pub tool: LogicalTool,
    pub arguments: Map<String, Value>,
}

impl From<&Step> for StepView {
    fn from(step: &Step) -> Self {
        Self {
            id: step.id.clone(),
            tool: step.tool,
            arguments: step.arguments.clone(),
        }
    }
}
