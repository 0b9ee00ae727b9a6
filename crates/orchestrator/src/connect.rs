//! Connection seam between the runtime and the transport.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use handrail_core::config::AutomationConfig;
use handrail_core::Result;
use handrail_protocol::{AutomationClient, ClientEvent, ProtocolSession};

/// Produces one connected protocol session per planned session. The runtime
/// only ever sees this trait, so scenario tests swap in scripted sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(Box<dyn ProtocolSession>, mpsc::Receiver<ClientEvent>)>;
}

/// Production connector: SSE stream plus JSON-RPC POST endpoint.
pub struct SseConnector {
    server_url: String,
    handshake_timeout: Duration,
}

impl SseConnector {
    pub fn new(server_url: &str, handshake_timeout: Duration) -> Self {
        Self {
            server_url: server_url.to_string(),
            handshake_timeout,
        }
    }

    pub fn from_config(config: &AutomationConfig) -> Self {
        Self::new(
            &config.server_url,
            Duration::from_secs(config.handshake_timeout_secs),
        )
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn connect(&self) -> Result<(Box<dyn ProtocolSession>, mpsc::Receiver<ClientEvent>)> {
        let (client, events) =
            AutomationClient::connect(&self.server_url, self.handshake_timeout).await?;
        Ok((Box::new(client) as Box<dyn ProtocolSession>, events))
    }
}
