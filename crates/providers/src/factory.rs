use handrail_core::Config;

use crate::{AnthropicProvider, OpenAIProvider, Provider};

/// Default api_base for OpenAI-compatible providers.
fn default_api_base(provider_name: &str) -> &'static str {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1",
        _ => "https://api.openai.com/v1",
    }
}

/// Infer the provider name from the model string prefix.
/// Returns None when the prefix gives no signal (fallback needed).
pub fn infer_provider_from_model(model: &str) -> Option<&'static str> {
    if model.starts_with("anthropic/") || model.starts_with("claude-") {
        Some("anthropic")
    } else if model.starts_with("openai/")
        || model.starts_with("gpt-")
        || model.starts_with("o1")
        || model.starts_with("o3")
    {
        Some("openai")
    } else {
        None
    }
}

/// Unified provider construction.
///
/// Resolution order:
/// 1. `explicit_provider` (from config.planner.provider or refineProvider)
/// 2. model string prefix (e.g. "anthropic/claude-..." or "gpt-4o")
/// 3. first provider in config with a non-empty api_key
///
/// An explicitly named provider must be configured with an API key;
/// inference failures fall through to the next tier instead.
pub fn create_provider(
    config: &Config,
    model: &str,
    explicit_provider: Option<&str>,
) -> anyhow::Result<Box<dyn Provider>> {
    let max_tokens = config.planner.max_tokens;
    let temperature = config.planner.temperature;

    let effective_provider: &str = if let Some(ep) = explicit_provider {
        ep
    } else if let Some(inferred) = infer_provider_from_model(model) {
        inferred
    } else if let Some((name, _)) = config.get_api_key() {
        name
    } else {
        return Err(anyhow::anyhow!(
            "No LLM provider configured. Set 'provider' in config, use a recognized model prefix \
             (e.g. 'anthropic/claude-...' or 'gpt-4o'), or add an API key to the providers section."
        ));
    };

    let provider_cfg = config.get_provider(effective_provider);

    if explicit_provider.is_some() {
        match provider_cfg {
            None => {
                return Err(anyhow::anyhow!(
                    "Provider '{}' is explicitly configured but not found in providers section",
                    effective_provider
                ));
            }
            Some(cfg) if cfg.api_key.is_empty() => {
                return Err(anyhow::anyhow!(
                    "Provider '{}' is explicitly configured but has no API key",
                    effective_provider
                ));
            }
            _ => {}
        }
    }

    let empty_cfg = handrail_core::config::ProviderConfig::default();
    let resolved_cfg = provider_cfg.unwrap_or(&empty_cfg);

    match effective_provider {
        "anthropic" => Ok(Box::new(AnthropicProvider::new(
            &resolved_cfg.api_key,
            resolved_cfg.api_base.as_deref(),
            model,
            max_tokens,
            temperature,
        )) as Box<dyn Provider>),
        _ => {
            // OpenAI-compatible: openai, openrouter and friends
            let api_base = resolved_cfg
                .api_base
                .as_deref()
                .unwrap_or_else(|| default_api_base(effective_provider));
            Ok(Box::new(OpenAIProvider::new(
                &resolved_cfg.api_key,
                Some(api_base),
                model,
                max_tokens,
                temperature,
            )) as Box<dyn Provider>)
        }
    }
}

/// Provider for turning instructions into step plans.
pub fn create_planner_provider(config: &Config) -> anyhow::Result<Box<dyn Provider>> {
    let model = &config.planner.model;
    let explicit_provider = config.planner.provider.as_deref();
    create_provider(config, model, explicit_provider)
}

/// Provider for argument refinement. Falls back to the planner model and
/// provider when no dedicated refine settings exist.
pub fn create_refiner_provider(config: &Config) -> anyhow::Result<Box<dyn Provider>> {
    let model = config
        .planner
        .refine_model
        .as_deref()
        .unwrap_or(&config.planner.model);

    let explicit_provider = config
        .planner
        .refine_provider
        .as_deref()
        .or(config.planner.provider.as_deref());

    create_provider(config, model, explicit_provider)
}
