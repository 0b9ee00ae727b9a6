//! Resolution of logical tools against the server's advertised tool list.
//!
//! Automation servers advertise concrete tool names ("browser_navigate",
//! "browser_click", ...) that vary across implementations. The catalog maps
//! each logical operation to the first advertised name containing its
//! keyword, once per session, so steps never carry server-specific names.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use handrail_core::{Error, LogicalTool, Result};

/// One entry from the server's tools/list result.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    entries: HashMap<LogicalTool, String>,
}

impl ToolCatalog {
    /// Match every logical tool against the advertised list. First
    /// containment match wins; logical tools with no match are simply
    /// absent and only fail once a step needs them.
    pub fn resolve(descriptors: &[ToolDescriptor]) -> Self {
        let mut entries = HashMap::new();
        for tool in LogicalTool::all() {
            let keyword = tool.keyword();
            let matched = descriptors
                .iter()
                .find(|d| d.name.to_lowercase().contains(keyword));
            if let Some(descriptor) = matched {
                debug!(logical = %tool, remote = %descriptor.name, "Resolved tool mapping");
                entries.insert(*tool, descriptor.name.clone());
            } else {
                debug!(logical = %tool, "No advertised tool matches");
            }
        }
        Self { entries }
    }

    pub fn remote_name(&self, tool: LogicalTool) -> Option<&str> {
        self.entries.get(&tool).map(|s| s.as_str())
    }

    /// Remote name for a tool a step is about to invoke. Unmapped tools
    /// fail here, before any network traffic.
    pub fn require(&self, tool: LogicalTool) -> Result<&str> {
        self.remote_name(tool).ok_or_else(|| {
            Error::ToolResolution(format!("no advertised tool matches '{}'", tool))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
