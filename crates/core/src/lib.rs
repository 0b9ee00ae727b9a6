pub mod chat;
pub mod config;
pub mod error;
pub mod paths;
pub mod step;

pub use chat::{ChatMessage, LLMResponse, ToolCallRequest};
pub use config::{Config, SnapshotPolicy};
pub use error::{Error, Result};
pub use paths::Paths;
pub use step::{LogicalTool, Step, StepView, UNKNOWN};
