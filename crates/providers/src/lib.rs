pub mod anthropic;
pub mod client;
pub mod factory;
pub mod openai;

use async_trait::async_trait;
use handrail_core::{ChatMessage, LLMResponse, Result};
use serde_json::Value;

/// An LLM backend. Tool schemas are passed in OpenAI function-calling shape;
/// each provider converts to its own wire format.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], tools: &[Value]) -> Result<LLMResponse>;
}

pub use anthropic::AnthropicProvider;
pub use factory::{
    create_planner_provider, create_provider, create_refiner_provider, infer_provider_from_model,
};
pub use openai::OpenAIProvider;
