//! Automation server client: SSE push stream plus JSON-RPC over HTTP POST.
//!
//! Connection order matters. The client opens the GET stream first, waits
//! for the endpoint event carrying the session id, then runs the initialize
//! exchange against the per-session POST endpoint. Responses may come back
//! either in the POST body or on the stream; both paths feed the same
//! pending-request map, so whichever arrives first settles the call and a
//! late duplicate is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use handrail_core::{Error, Result};

use crate::catalog::ToolDescriptor;
use crate::content::{parse_tool_result, ToolOutput};
use crate::jsonrpc::{Notification, Request, Response};
use crate::sse::SseParser;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Remote failure for one tool call, either a JSON-RPC error object or a
/// result flagged isError.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}) {}", self.code, self.message)
    }
}

/// Push events delivered to whoever drives the session.
#[derive(Debug)]
pub enum ClientEvent {
    /// Outcome of a call_tool request, correlated by request id.
    ToolResult {
        id: u64,
        outcome: std::result::Result<ToolOutput, RpcError>,
    },
    /// The push stream ended. The session is unusable afterwards.
    Disconnected { reason: String },
}

enum Waiter {
    /// Caller is awaiting the reply inline (initialize, tools/list).
    Oneshot(oneshot::Sender<std::result::Result<Value, String>>),
    /// Reply is delivered on the events channel (tools/call).
    Event,
}

type PendingMap = Arc<Mutex<HashMap<u64, Waiter>>>;

/// Session surface the orchestrator drives. The production implementation
/// is [`AutomationClient`]; tests substitute scripted ones.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    fn session_id(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Fire a tools/call and return its request id immediately. The outcome
    /// arrives later as [`ClientEvent::ToolResult`] with the same id.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<u64>;

    async fn close(&self);
}

// ─────────────────────────── Client ───────────────────────────

pub struct AutomationClient {
    http: Client,
    session_endpoint: String,
    session_id: String,
    next_id: Arc<AtomicU64>,
    pending: PendingMap,
    event_tx: mpsc::Sender<ClientEvent>,
    /// Bounds the inline waits: endpoint handshake, initialize, tools/list.
    rpc_timeout: Duration,
    reader_handle: JoinHandle<()>,
}

impl AutomationClient {
    /// Open the stream, complete the endpoint handshake, and initialize the
    /// protocol session. Returns the client plus the receiver for push
    /// events (tool results and disconnects).
    pub async fn connect(
        server_url: &str,
        handshake_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>)> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {}", e)))?;

        debug!(url = %server_url, "Opening automation stream");
        let response = http
            .get(server_url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::Connection(format!("connect to {} failed: {}", server_url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Connection(format!(
                "connect to {} failed: HTTP {}",
                server_url, status
            )));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel(32);
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let reader_handle = tokio::spawn(reader_task(
            response,
            pending.clone(),
            event_tx.clone(),
            endpoint_tx,
        ));

        let fragment = match tokio::time::timeout(handshake_timeout, endpoint_rx).await {
            Ok(Ok(fragment)) => fragment,
            Ok(Err(_)) => {
                reader_handle.abort();
                return Err(Error::Connection(
                    "stream closed before endpoint handshake".to_string(),
                ));
            }
            Err(_) => {
                reader_handle.abort();
                return Err(Error::Timeout(format!(
                    "no endpoint handshake within {}s",
                    handshake_timeout.as_secs()
                )));
            }
        };

        let (session_endpoint, session_id) = match parse_session_endpoint(server_url, &fragment) {
            Ok(pair) => pair,
            Err(e) => {
                reader_handle.abort();
                return Err(e);
            }
        };

        info!(session_id = %session_id, "Automation session established");

        let client = Self {
            http,
            session_endpoint,
            session_id,
            next_id: Arc::new(AtomicU64::new(1)),
            pending,
            event_tx,
            rpc_timeout: handshake_timeout,
            reader_handle,
        };

        client.initialize().await?;

        Ok((client, event_rx))
    }

    async fn initialize(&self) -> Result<()> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "handrail",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let result = self.call("initialize", Some(params)).await?;
        debug!(
            session_id = %self.session_id,
            server = %result
                .get("serverInfo")
                .and_then(|s| s.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or("unknown"),
            "Protocol session initialized"
        );

        let notif = Notification::new("notifications/initialized", None);
        self.post(&serde_json::to_string(&notif)?).await?;
        Ok(())
    }

    /// Issue a request and wait inline for its reply, wherever it arrives.
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.pending.lock().await;
            map.insert(id, Waiter::Oneshot(tx));
        }

        debug!(session_id = %self.session_id, id, method, "→ request");
        if let Err(e) = self.post(&serde_json::to_string(&request)?).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(Error::Protocol(format!("{} failed: {}", method, message))),
            Ok(Err(_)) => Err(Error::Connection(format!(
                "stream closed while waiting for {}",
                method
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Timeout(format!(
                    "no reply to {} within {}s",
                    method,
                    self.rpc_timeout.as_secs()
                )))
            }
        }
    }

    /// POST a payload to the session endpoint. Servers may answer with the
    /// full JSON-RPC reply in the body instead of pushing it on the stream;
    /// such bodies are dispatched through the same correlation map.
    async fn post(&self, body: &str) -> Result<()> {
        let response = self
            .http
            .post(&self.session_endpoint)
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| Error::Connection(format!("POST to session endpoint failed: {}", e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Protocol(format!(
                "session endpoint returned HTTP {}: {}",
                status, text
            )));
        }

        if let Some(reply) = Response::from_body(&text) {
            dispatch_response(reply, &self.pending, &self.event_tx).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolSession for AutomationClient {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let result = self.call("tools/list", None).await?;
        let tools: Vec<ToolDescriptor> = serde_json::from_value(
            result.get("tools").cloned().unwrap_or(Value::Array(vec![])),
        )
        .map_err(|e| Error::Protocol(format!("malformed tools/list payload: {}", e)))?;
        debug!(session_id = %self.session_id, count = tools.len(), "Remote tools listed");
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(
            id,
            "tools/call",
            Some(serde_json::json!({
                "name": name,
                "arguments": arguments,
            })),
        );

        {
            let mut map = self.pending.lock().await;
            map.insert(id, Waiter::Event);
        }

        debug!(session_id = %self.session_id, id, tool = %name, "→ tools/call");
        if let Err(e) = self.post(&serde_json::to_string(&request)?).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    async fn close(&self) {
        self.reader_handle.abort();
        self.pending.lock().await.clear();
        debug!(session_id = %self.session_id, "Automation session closed");
    }
}

impl Drop for AutomationClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

// ─────────────────────────── Stream reader ───────────────────────────

/// Background task: parse the SSE stream and dispatch JSON-RPC replies by
/// id. The first endpoint event resolves the connect handshake. On stream
/// close every inline waiter is failed, then Disconnected is emitted.
async fn reader_task(
    mut response: reqwest::Response,
    pending: PendingMap,
    events: mpsc::Sender<ClientEvent>,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut parser = SseParser::new();
    let mut endpoint_tx = Some(endpoint_tx);

    let reason = loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                for event in parser.feed(&chunk) {
                    match event.event.as_str() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(event.data);
                            } else {
                                warn!("Duplicate endpoint event ignored");
                            }
                        }
                        "message" => match serde_json::from_str::<Response>(&event.data) {
                            Ok(reply) if reply.is_reply() => {
                                dispatch_response(reply, &pending, &events).await;
                            }
                            Ok(_) => debug!("Ignoring non-reply stream message"),
                            Err(e) => warn!(error = %e, "Unparseable stream message"),
                        },
                        other => debug!(event = %other, "Ignoring unknown stream event"),
                    }
                }
            }
            Ok(None) => break "stream ended".to_string(),
            Err(e) => break format!("stream read error: {}", e),
        }
    };

    warn!(reason = %reason, "Automation stream closed");

    // Fail inline waiters. Event waiters are dropped without a per-call
    // result; Disconnected supersedes them.
    let waiters: Vec<(u64, Waiter)> = {
        let mut map = pending.lock().await;
        map.drain().collect()
    };
    for (_, waiter) in waiters {
        if let Waiter::Oneshot(tx) = waiter {
            let _ = tx.send(Err(format!("stream closed: {}", reason)));
        }
    }

    let _ = events.send(ClientEvent::Disconnected { reason }).await;
}

/// Route one reply to whoever is waiting on its id. A reply with no pending
/// entry (already settled via the other path, or deadline-abandoned) is
/// dropped with a debug log.
async fn dispatch_response(
    reply: Response,
    pending: &PendingMap,
    events: &mpsc::Sender<ClientEvent>,
) {
    let Some(id) = reply.id else {
        debug!("Dropping reply without id");
        return;
    };
    let waiter = {
        let mut map = pending.lock().await;
        map.remove(&id)
    };
    let Some(waiter) = waiter else {
        debug!(id, "Dropping reply with no pending request");
        return;
    };

    match waiter {
        Waiter::Oneshot(tx) => {
            let payload = match reply.error {
                Some(err) => Err(format!("JSON-RPC error {}: {}", err.code, err.message)),
                None => Ok(reply.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(payload);
        }
        Waiter::Event => {
            let outcome = match reply.error {
                Some(err) => Err(RpcError {
                    code: err.code,
                    message: err.message,
                }),
                None => Ok(parse_tool_result(&reply.result.unwrap_or(Value::Null))),
            };
            let _ = events.send(ClientEvent::ToolResult { id, outcome }).await;
        }
    }
}

/// Join the handshake fragment against the base URL and pull out the
/// session id. Fragments are relative in practice ("/messages?sessionId=..")
/// but absolute URLs are tolerated.
fn parse_session_endpoint(base_url: &str, fragment: &str) -> Result<(String, String)> {
    let base = url::Url::parse(base_url)
        .map_err(|e| Error::Connection(format!("invalid server url {}: {}", base_url, e)))?;
    let endpoint = base
        .join(fragment)
        .map_err(|e| Error::Protocol(format!("invalid endpoint fragment {:?}: {}", fragment, e)))?;
    let session_id = endpoint
        .query_pairs()
        .find(|(key, _)| key == "sessionId")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| {
            Error::Protocol(format!("endpoint handshake carries no sessionId: {:?}", fragment))
        })?;
    Ok((endpoint.to_string(), session_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_endpoint_relative_fragment() {
        let (endpoint, session_id) = parse_session_endpoint(
            "http://localhost:8931/sse",
            "/messages?sessionId=d2f8a1",
        )
        .unwrap();
        assert_eq!(endpoint, "http://localhost:8931/messages?sessionId=d2f8a1");
        assert_eq!(session_id, "d2f8a1");
    }

    #[test]
    fn test_session_endpoint_absolute_fragment() {
        let (endpoint, session_id) = parse_session_endpoint(
            "http://localhost:8931/sse",
            "http://localhost:9000/messages?sessionId=abc",
        )
        .unwrap();
        assert_eq!(endpoint, "http://localhost:9000/messages?sessionId=abc");
        assert_eq!(session_id, "abc");
    }

    #[test]
    fn test_session_endpoint_missing_session_id() {
        let err = parse_session_endpoint("http://localhost:8931/sse", "/messages").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_session_endpoint_preserves_extra_query() {
        let (endpoint, session_id) = parse_session_endpoint(
            "http://localhost:8931/sse",
            "/messages?transport=sse&sessionId=zz9",
        )
        .unwrap();
        assert!(endpoint.contains("transport=sse"));
        assert_eq!(session_id, "zz9");
    }
}
