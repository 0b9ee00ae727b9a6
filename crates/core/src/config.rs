use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Explicit LLM provider (optional). When absent the provider is
    /// inferred from the model string prefix (e.g. "anthropic/claude-...").
    #[serde(default)]
    pub provider: Option<String>,
    /// Model used for argument refinement. Falls back to the planner model.
    #[serde(default)]
    pub refine_model: Option<String>,
    #[serde(default)]
    pub refine_provider: Option<String>,
    /// Hard cap on plan length; longer plans are truncated with a warning.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_steps() -> usize {
    10
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            provider: None,
            refine_model: None,
            refine_provider: None,
            max_steps: default_max_steps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfig {
    /// SSE endpoint of the browser-automation server.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Budget for the endpoint handshake and for tools/list.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Per-call deadline for tool executions whose result arrives on the stream.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_server_url() -> String {
    "http://localhost:8931/sse".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    20
}

fn default_call_timeout_secs() -> u64 {
    60
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

/// When the runtime captures a page snapshot on its own initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotPolicy {
    /// Capture only when the next step needs refinement and no snapshot is held.
    OnDemand,
    /// Refresh after every successful execution that returned no snapshot.
    EachStep,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::OnDemand
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Re-attempts allowed per step before the session enters Error.
    /// 0 means the first failure is terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    #[serde(default)]
    pub snapshot_policy: SnapshotPolicy,
}

fn default_max_retries() -> u32 {
    0
}

fn default_confirm_timeout_secs() -> u64 {
    120
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            snapshot_policy: SnapshotPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    8790
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert("anthropic".to_string(), ProviderConfig::default());
        providers.insert("openai".to_string(), ProviderConfig::default());
        providers.insert("openrouter".to_string(), ProviderConfig {
            api_key: String::new(),
            api_base: Some("https://openrouter.ai/api/v1".to_string()),
        });

        Self {
            providers,
            planner: PlannerConfig::default(),
            automation: AutomationConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// First configured provider with a non-empty key, in preference order.
    pub fn get_api_key(&self) -> Option<(&str, &ProviderConfig)> {
        let priority = ["anthropic", "openai", "openrouter"];

        for name in priority {
            if let Some(provider) = self.providers.get(name) {
                if !provider.api_key.is_empty() {
                    return Some((name, provider));
                }
            }
        }
        None
    }

    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.orchestrator.max_retries, 0);
        assert_eq!(cfg.orchestrator.confirm_timeout_secs, 120);
        assert_eq!(cfg.orchestrator.snapshot_policy, SnapshotPolicy::OnDemand);
        assert_eq!(cfg.automation.handshake_timeout_secs, 20);
        assert_eq!(cfg.planner.max_steps, 10);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let raw = r#"{
  "providers": { "anthropic": { "apiKey": "sk-test" } },
  "orchestrator": { "maxRetries": 2, "snapshotPolicy": "eachStep" }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.providers["anthropic"].api_key, "sk-test");
        assert_eq!(cfg.orchestrator.max_retries, 2);
        assert_eq!(cfg.orchestrator.snapshot_policy, SnapshotPolicy::EachStep);
        assert_eq!(cfg.orchestrator.confirm_timeout_secs, 120);
        assert_eq!(cfg.automation.server_url, "http://localhost:8931/sse");
    }

    #[test]
    fn test_get_api_key_priority() {
        let mut cfg = Config::default();
        assert!(cfg.get_api_key().is_none());

        cfg.providers.get_mut("openai").unwrap().api_key = "sk-openai".to_string();
        let (name, _) = cfg.get_api_key().unwrap();
        assert_eq!(name, "openai");

        cfg.providers.get_mut("anthropic").unwrap().api_key = "sk-ant".to_string();
        let (name, _) = cfg.get_api_key().unwrap();
        assert_eq!(name, "anthropic");
    }
}
