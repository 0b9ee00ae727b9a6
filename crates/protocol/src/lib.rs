//! Client side of the automation protocol: JSON-RPC 2.0 over HTTP POST with
//! a server-sent-event push stream for replies and the session handshake.

pub mod catalog;
pub mod client;
pub mod content;
pub mod jsonrpc;
pub mod sse;

pub use catalog::{ToolCatalog, ToolDescriptor};
pub use client::{AutomationClient, ClientEvent, ProtocolSession, RpcError};
pub use content::{parse_tool_result, ToolOutput};
