//! Session orchestration: plans browser-automation steps from natural
//! language, walks a human through confirming each one, and executes them
//! over the automation protocol.

pub mod connect;
pub mod events;
pub mod handle;
pub mod llm;
pub mod parser;
pub mod refine;
pub mod runtime;
pub mod sequencer;
pub mod session;

pub use connect::{Connector, SseConnector};
pub use handle::{Orchestrator, SessionHandle};
pub use llm::{LlmPlanner, LlmRefiner};
pub use parser::StepParser;
pub use refine::{Refiner, RefinementBridge};
pub use runtime::RuntimeConfig;
pub use session::{FsmSnapshot, FsmState};
