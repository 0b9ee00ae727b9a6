//! The session runtime: one actor task owning all FSM state.
//!
//! Every mutation happens inside this task. Commands arrive over mpsc from
//! [`crate::handle::SessionHandle`], protocol events over the client's push
//! channel, and sub-task completions (planning, refinement, timers) over an
//! internal loop channel. Slow work never runs inline: planning and
//! refinement are spawned, and their results carry a generation stamp so
//! anything finishing after a discard is dropped instead of applied to a
//! later session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use handrail_core::config::{Config, SnapshotPolicy};
use handrail_core::{Error, LogicalTool, Result, StepView};
use handrail_protocol::{ClientEvent, ProtocolSession, ToolCatalog, ToolOutput};

use crate::connect::Connector;
use crate::events::{LoopEvent, PlannedBundle, SessionCommand};
use crate::parser::StepParser;
use crate::refine::RefinementBridge;
use crate::sequencer;
use crate::session::{FsmSnapshot, FsmState, Session};

/// Runtime knobs, flattened out of the config file sections.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Re-attempts allowed per step before the session fails. 0 means the
    /// first failure is terminal.
    pub max_retries: u32,
    pub confirm_timeout: Duration,
    pub call_timeout: Duration,
    pub snapshot_policy: SnapshotPolicy,
}

impl RuntimeConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.orchestrator.max_retries,
            confirm_timeout: Duration::from_secs(config.orchestrator.confirm_timeout_secs),
            call_timeout: Duration::from_secs(config.automation.call_timeout_secs),
            snapshot_policy: config.orchestrator.snapshot_policy,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The single in-flight protocol call, if any.
struct PendingCall {
    id: u64,
    purpose: CallPurpose,
    issued_at: Instant,
}

enum CallPurpose {
    /// Executing the current step.
    Step { step_id: String },
    /// Transparent diagnostic snapshot; `then` says how to continue once
    /// the page state is refreshed.
    Refresh { then: AfterRefresh },
}

#[derive(Debug, Clone, Copy)]
enum AfterRefresh {
    /// Hand the fresh snapshot to the refinement bridge.
    Refine,
    /// Keep advancing past the step at `after`.
    Advance { after: usize },
}

enum Input {
    Command(SessionCommand),
    Internal(LoopEvent),
    Client(Option<ClientEvent>),
}

pub struct SessionRuntime {
    config: RuntimeConfig,
    connector: Arc<dyn Connector>,
    parser: Arc<dyn StepParser>,
    bridge: RefinementBridge,

    state: FsmState,
    session: Option<Session>,
    client: Option<Box<dyn ProtocolSession>>,
    client_events: Option<mpsc::Receiver<ClientEvent>>,
    catalog: Option<ToolCatalog>,
    pending: Option<PendingCall>,
    pending_start: Option<oneshot::Sender<Result<Vec<StepView>>>>,
    last_error: Option<String>,

    /// Whether any step of the current session has executed; refinement
    /// can only capture page state once something has run.
    executed_any: bool,
    /// Set when the sequencer jumps a parsed-in diagnostic step; the next
    /// refinement then refuses the held snapshot and captures fresh.
    snapshot_stale: bool,

    task_generation: u64,
    timer_generation: u64,
    confirm_timer: Option<JoinHandle<()>>,

    command_rx: mpsc::Receiver<SessionCommand>,
    loop_tx: mpsc::Sender<LoopEvent>,
    loop_rx: mpsc::Receiver<LoopEvent>,
}

async fn recv_client(rx: Option<&mut mpsc::Receiver<ClientEvent>>) -> Option<ClientEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionRuntime {
    pub fn new(
        config: RuntimeConfig,
        connector: Arc<dyn Connector>,
        parser: Arc<dyn StepParser>,
        bridge: RefinementBridge,
        command_rx: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        let (loop_tx, loop_rx) = mpsc::channel(32);
        Self {
            config,
            connector,
            parser,
            bridge,
            state: FsmState::Idle,
            session: None,
            client: None,
            client_events: None,
            catalog: None,
            pending: None,
            pending_start: None,
            last_error: None,
            executed_any: false,
            snapshot_stale: false,
            task_generation: 0,
            timer_generation: 0,
            confirm_timer: None,
            command_rx,
            loop_tx,
            loop_rx,
        }
    }

    pub async fn run(mut self) {
        debug!("Session runtime started");
        loop {
            let input = {
                let client_rx = self.client_events.as_mut();
                tokio::select! {
                    command = self.command_rx.recv() => match command {
                        Some(command) => Input::Command(command),
                        None => break,
                    },
                    Some(event) = self.loop_rx.recv() => Input::Internal(event),
                    event = recv_client(client_rx) => Input::Client(event),
                }
            };
            match input {
                Input::Command(command) => self.handle_command(command).await,
                Input::Internal(event) => self.handle_internal(event).await,
                Input::Client(Some(event)) => self.handle_client_event(event).await,
                Input::Client(None) => {
                    debug!("Client event channel closed");
                    self.client_events = None;
                }
            }
        }
        debug!("Session runtime stopped");
    }

    // ─────────────────────────── Commands ───────────────────────────

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start { instruction, reply } => self.handle_start(instruction, reply),
            SessionCommand::Confirm { reply } => self.handle_confirm(reply).await,
            SessionCommand::Reject { reply } => self.handle_reject(reply).await,
            SessionCommand::Cancel { reply } => self.handle_cancel(reply).await,
            SessionCommand::Status { reply } => {
                let _ = reply.send(self.status_snapshot());
            }
        }
    }

    fn handle_start(
        &mut self,
        instruction: String,
        reply: oneshot::Sender<Result<Vec<StepView>>>,
    ) {
        if self.state != FsmState::Idle || self.pending_start.is_some() {
            let _ = reply.send(Err(Error::Session(
                "a session is already active".to_string(),
            )));
            return;
        }

        info!(instruction = %instruction, "Planning session");
        self.pending_start = Some(reply);

        let connector = self.connector.clone();
        let parser = self.parser.clone();
        let loop_tx = self.loop_tx.clone();
        let generation = self.task_generation;
        tokio::spawn(async move {
            let result = plan_session(connector, parser, instruction).await;
            let _ = loop_tx
                .send(LoopEvent::Planned { generation, result })
                .await;
        });
    }

    async fn handle_confirm(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.state != FsmState::WaitConfirm {
            debug!(state = %self.state, "Confirm outside WaitConfirm ignored");
            let _ = reply.send(Ok(()));
            return;
        }
        self.cancel_confirm_timer();
        if let Some(session) = self.session.as_mut() {
            session.retry_count = 0;
        }
        if let Some(idx) = self.session.as_ref().and_then(|s| s.current) {
            info!(step = idx, "Step confirmed");
        }
        self.state = FsmState::Execute;
        let _ = reply.send(Ok(()));
        self.issue_step_call().await;
    }

    async fn handle_reject(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.state == FsmState::WaitConfirm {
            info!("Steps rejected; discarding session");
            self.discard_session().await;
        } else {
            debug!(state = %self.state, "Reject outside WaitConfirm ignored");
        }
        let _ = reply.send(Ok(()));
    }

    async fn handle_cancel(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.state {
            FsmState::Idle => {
                if self.pending_start.is_some() {
                    info!("Session start cancelled");
                    self.task_generation += 1;
                    if let Some(tx) = self.pending_start.take() {
                        let _ = tx.send(Err(Error::Session(
                            "session start cancelled".to_string(),
                        )));
                    }
                } else {
                    debug!("Cancel with no active session");
                }
            }
            FsmState::Error => {
                info!("Error state cleared");
                self.discard_session().await;
            }
            _ => {
                info!("Session cancelled");
                self.discard_session().await;
            }
        }
        let _ = reply.send(Ok(()));
    }

    // ─────────────────────────── Internal events ───────────────────────────

    async fn handle_internal(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Planned { generation, result } => {
                self.handle_planned(generation, result).await
            }
            LoopEvent::Refined {
                generation,
                step_id,
                result,
            } => self.handle_refined(generation, step_id, result).await,
            LoopEvent::ConfirmTimeout { generation } => {
                if generation != self.timer_generation || self.state != FsmState::WaitConfirm {
                    debug!("Stale confirmation timer ignored");
                    return;
                }
                info!(
                    timeout_secs = self.config.confirm_timeout.as_secs(),
                    "Confirmation timed out; discarding session"
                );
                self.discard_session().await;
            }
            LoopEvent::CallDeadline {
                generation,
                request_id,
            } => self.handle_call_deadline(generation, request_id).await,
        }
    }

    async fn handle_planned(&mut self, generation: u64, result: Result<PlannedBundle>) {
        if generation != self.task_generation {
            debug!("Stale planning result dropped");
            return;
        }
        let reply = self.pending_start.take();
        match result {
            Ok(bundle) => {
                info!(
                    session_id = %bundle.session_id,
                    steps = bundle.steps.len(),
                    catalog = bundle.catalog.len(),
                    "Session planned"
                );
                let visible = sequencer::visible_steps(&bundle.steps);
                self.session = Some(Session {
                    session_id: bundle.session_id,
                    instruction: bundle.instruction,
                    steps: bundle.steps,
                    current: None,
                    latest_snapshot: None,
                    retry_count: 0,
                    started_at: Utc::now(),
                });
                self.client = Some(bundle.client);
                self.client_events = Some(bundle.events);
                self.catalog = Some(bundle.catalog);
                self.executed_any = false;
                self.snapshot_stale = false;
                self.last_error = None;
                if let Some(tx) = reply {
                    let _ = tx.send(Ok(visible));
                }
                self.advance_from(None).await;
            }
            Err(e) => {
                let message = e.to_string();
                if let Some(tx) = reply {
                    let _ = tx.send(Err(e));
                }
                self.enter_error(message).await;
            }
        }
    }

    async fn handle_refined(
        &mut self,
        generation: u64,
        step_id: String,
        result: Result<Map<String, Value>>,
    ) {
        if generation != self.task_generation {
            debug!("Stale refinement result dropped");
            return;
        }
        if self.state != FsmState::WaitRefinement {
            debug!(state = %self.state, "Refinement result outside WaitRefinement dropped");
            return;
        }
        let Some(idx) = self.session.as_ref().and_then(|s| s.current) else {
            return;
        };
        let matches = self
            .session
            .as_ref()
            .and_then(|s| s.steps.get(idx))
            .map(|step| step.id == step_id)
            .unwrap_or(false);
        if !matches {
            debug!(step_id = %step_id, "Refinement result for a different step dropped");
            return;
        }

        match result {
            Ok(arguments) => {
                if let Some(session) = self.session.as_mut() {
                    if let Some(step) = session.steps.get_mut(idx) {
                        step.arguments = arguments;
                    }
                    session.retry_count = 0;
                }
                info!(step = idx, "Step arguments refined");
                self.enter_wait_confirm();
            }
            Err(e) => {
                self.handle_step_failure(format!("refinement failed: {}", e))
                    .await
            }
        }
    }

    async fn handle_call_deadline(&mut self, generation: u64, request_id: u64) {
        if generation != self.task_generation {
            debug!("Stale call deadline ignored");
            return;
        }
        let matches = self.pending.as_ref().map(|p| p.id == request_id);
        if matches != Some(true) {
            debug!(request_id, "Call deadline for a settled request ignored");
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };
        warn!(
            request_id,
            deadline_secs = self.config.call_timeout.as_secs(),
            "No response within deadline"
        );
        let message = format!(
            "no response within {}s",
            self.config.call_timeout.as_secs()
        );
        match pending.purpose {
            CallPurpose::Step { .. } => self.handle_step_failure(message).await,
            CallPurpose::Refresh { then } => self.refresh_failed(then, message).await,
        }
    }

    // ─────────────────────────── Protocol events ───────────────────────────

    async fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::ToolResult { id, outcome } => {
                let matches = self.pending.as_ref().map(|p| p.id == id);
                if matches != Some(true) {
                    debug!(id, "Unmatched tool result dropped");
                    return;
                }
                let Some(pending) = self.pending.take() else {
                    return;
                };
                debug!(
                    id,
                    elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
                    "Tool call settled"
                );
                match pending.purpose {
                    CallPurpose::Step { .. } => match outcome {
                        Ok(output) if !output.is_error => self.on_step_success(output).await,
                        Ok(output) => {
                            let detail = if output.text.is_empty() {
                                "remote tool reported failure".to_string()
                            } else {
                                format!("remote tool reported failure: {}", output.text)
                            };
                            self.handle_step_failure(detail).await;
                        }
                        Err(rpc) => {
                            let err = Error::RemoteExecution {
                                code: rpc.code,
                                message: rpc.message,
                            };
                            self.handle_step_failure(err.to_string()).await;
                        }
                    },
                    CallPurpose::Refresh { then } => self.on_refresh_settled(then, outcome).await,
                }
            }
            ClientEvent::Disconnected { reason } => match self.state {
                FsmState::Idle | FsmState::Error => {
                    debug!(reason = %reason, "Disconnect with no active session")
                }
                _ => {
                    self.enter_error(format!("connection lost: {}", reason))
                        .await
                }
            },
        }
    }

    async fn on_step_success(&mut self, output: ToolOutput) {
        let Some(idx) = self.session.as_ref().and_then(|s| s.current) else {
            return;
        };
        let had_embedded = output.snapshot.is_some();
        if let Some(snapshot) = output.snapshot {
            if let Some(session) = self.session.as_mut() {
                session.latest_snapshot = Some(snapshot);
            }
            self.snapshot_stale = false;
        }
        self.executed_any = true;
        info!(step = idx, "Step executed");

        let more = self
            .session
            .as_ref()
            .map(|s| sequencer::next_executable(&s.steps, Some(idx)).is_some())
            .unwrap_or(false);
        if !more {
            self.finish_session().await;
            return;
        }
        if self.config.snapshot_policy == SnapshotPolicy::EachStep && !had_embedded {
            if let Err(message) = self.issue_capture(AfterRefresh::Advance { after: idx }).await {
                warn!(error = %message, "Diagnostic snapshot failed; continuing");
                self.advance_from(Some(idx)).await;
            }
            return;
        }
        self.advance_from(Some(idx)).await;
    }

    async fn on_refresh_settled(
        &mut self,
        then: AfterRefresh,
        outcome: std::result::Result<ToolOutput, handrail_protocol::RpcError>,
    ) {
        match outcome {
            Ok(output) if !output.is_error => {
                let captured = match output.snapshot {
                    Some(snapshot) => Some(snapshot),
                    None if !output.text.is_empty() => Some(output.text),
                    None => None,
                };
                match captured {
                    Some(snapshot) => {
                        if let Some(session) = self.session.as_mut() {
                            session.latest_snapshot = Some(snapshot);
                        }
                        self.snapshot_stale = false;
                        debug!("Page snapshot refreshed");
                        match then {
                            AfterRefresh::Refine => self.spawn_refinement().await,
                            AfterRefresh::Advance { after } => self.advance_from(Some(after)).await,
                        }
                    }
                    None => {
                        self.refresh_failed(then, "snapshot call returned no page state".to_string())
                            .await
                    }
                }
            }
            Ok(output) => {
                self.refresh_failed(then, format!("snapshot tool failed: {}", output.text))
                    .await
            }
            Err(rpc) => {
                self.refresh_failed(then, format!("snapshot call failed {}", rpc))
                    .await
            }
        }
    }

    /// Diagnostic captures get a single attempt. For refinement the page
    /// state is mandatory, so failure is terminal; between steps it is
    /// best-effort and the session keeps advancing.
    async fn refresh_failed(&mut self, then: AfterRefresh, message: String) {
        match then {
            AfterRefresh::Refine => {
                self.enter_error(format!("state capture for refinement failed: {}", message))
                    .await
            }
            AfterRefresh::Advance { after } => {
                warn!(error = %message, "Diagnostic snapshot failed; continuing");
                self.advance_from(Some(after)).await;
            }
        }
    }

    // ─────────────────────────── Step progression ───────────────────────────

    async fn advance_from(&mut self, after: Option<usize>) {
        let (next, jumped) = {
            let Some(session) = self.session.as_ref() else {
                return;
            };
            let next = sequencer::next_executable(&session.steps, after);
            let jumped = next
                .map(|idx| sequencer::skipped_diagnostics(&session.steps, after, idx))
                .unwrap_or(false);
            (next, jumped)
        };
        match next {
            None => self.finish_session().await,
            Some(idx) => {
                if jumped {
                    debug!("Skipped diagnostic step; held snapshot marked stale");
                    self.snapshot_stale = true;
                }
                self.select_step(idx).await;
            }
        }
    }

    async fn select_step(&mut self, idx: usize) {
        let needs_refinement = {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            session.current = Some(idx);
            session.retry_count = 0;
            session
                .steps
                .get(idx)
                .map(|step| step.needs_refinement())
                .unwrap_or(false)
        };
        if needs_refinement {
            self.begin_refinement().await;
        } else {
            self.enter_wait_confirm();
        }
    }

    async fn begin_refinement(&mut self) {
        let holds_snapshot = self
            .session
            .as_ref()
            .map(|s| s.latest_snapshot.is_some())
            .unwrap_or(false);
        if holds_snapshot && !self.snapshot_stale {
            self.spawn_refinement().await;
        } else if self.executed_any {
            self.state = FsmState::WaitRefinement;
            if let Err(message) = self.issue_capture(AfterRefresh::Refine).await {
                self.enter_error(format!("state capture for refinement failed: {}", message))
                    .await;
            }
        } else {
            self.enter_error(
                "step requires refinement but no page snapshot is available yet".to_string(),
            )
            .await;
        }
    }

    async fn spawn_refinement(&mut self) {
        let prepared = {
            let Some(session) = self.session.as_ref() else {
                return;
            };
            let Some(idx) = session.current else {
                return;
            };
            match (session.steps.get(idx), session.latest_snapshot.as_ref()) {
                (Some(step), Some(snapshot)) => Some((idx, step.clone(), snapshot.clone())),
                _ => None,
            }
        };
        let Some((idx, step, snapshot)) = prepared else {
            self.enter_error("refinement requested without a held snapshot".to_string())
                .await;
            return;
        };

        info!(step = idx, tool = %step.tool, "Refining step arguments");
        let bridge = self.bridge.clone();
        let generation = self.task_generation;
        let loop_tx = self.loop_tx.clone();
        let step_id = step.id.clone();
        tokio::spawn(async move {
            let result = bridge.refine(&step, &snapshot).await;
            let _ = loop_tx
                .send(LoopEvent::Refined {
                    generation,
                    step_id,
                    result,
                })
                .await;
        });
        self.state = FsmState::WaitRefinement;
    }

    fn enter_wait_confirm(&mut self) {
        self.cancel_confirm_timer();
        let generation = self.timer_generation;
        let timeout = self.config.confirm_timeout;
        let loop_tx = self.loop_tx.clone();
        self.confirm_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = loop_tx.send(LoopEvent::ConfirmTimeout { generation }).await;
        }));
        self.state = FsmState::WaitConfirm;
        if let Some(session) = self.session.as_ref() {
            if let Some(step) = session.current.and_then(|i| session.steps.get(i)) {
                info!(tool = %step.tool, "Awaiting confirmation");
            }
        }
    }

    async fn issue_step_call(&mut self) {
        let (remote, arguments, step_id) = match self.prepare_call() {
            Ok(prepared) => prepared,
            Err(message) => {
                self.enter_error(message).await;
                return;
            }
        };
        loop {
            let result = match self.client.as_ref() {
                Some(client) => client.call_tool(&remote, arguments.clone()).await,
                None => return,
            };
            match result {
                Ok(id) => {
                    debug!(id, tool = %remote, "Issued step call");
                    self.pending = Some(PendingCall {
                        id,
                        purpose: CallPurpose::Step { step_id },
                        issued_at: Instant::now(),
                    });
                    self.arm_call_deadline(id);
                    return;
                }
                Err(e) => {
                    let message = format!("request failed: {}", e);
                    if self.register_failure() {
                        self.enter_error(message).await;
                        return;
                    }
                    warn!(error = %e, "Step request failed; retrying");
                }
            }
        }
    }

    /// Resolve everything a step call needs. An unmapped logical tool fails
    /// here, before any network traffic and outside the retry budget.
    fn prepare_call(&self) -> std::result::Result<(String, Value, String), String> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| "no active session".to_string())?;
        let idx = session
            .current
            .ok_or_else(|| "no current step".to_string())?;
        let step = session
            .steps
            .get(idx)
            .ok_or_else(|| "step index out of range".to_string())?;
        let catalog = self
            .catalog
            .as_ref()
            .ok_or_else(|| "no tool catalog".to_string())?;
        let remote = catalog.require(step.tool).map_err(|e| e.to_string())?;
        Ok((
            remote.to_string(),
            Value::Object(step.arguments.clone()),
            step.id.clone(),
        ))
    }

    async fn issue_capture(&mut self, then: AfterRefresh) -> std::result::Result<(), String> {
        let remote = self
            .catalog
            .as_ref()
            .and_then(|catalog| catalog.remote_name(LogicalTool::Snapshot))
            .map(str::to_string);
        let Some(remote) = remote else {
            return Err("snapshot tool not advertised by server".to_string());
        };
        let result = match self.client.as_ref() {
            Some(client) => client.call_tool(&remote, Value::Object(Map::new())).await,
            None => return Err("no active connection".to_string()),
        };
        match result {
            Ok(id) => {
                debug!(id, "Issued diagnostic snapshot call");
                self.pending = Some(PendingCall {
                    id,
                    purpose: CallPurpose::Refresh { then },
                    issued_at: Instant::now(),
                });
                self.arm_call_deadline(id);
                Ok(())
            }
            Err(e) => Err(format!("snapshot request failed: {}", e)),
        }
    }

    // ─────────────────────────── Failure and teardown ───────────────────────────

    /// Count a failure against the session budget. True means exhausted.
    fn register_failure(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return true;
        };
        session.retry_count += 1;
        session.retry_count > self.config.max_retries
    }

    async fn handle_step_failure(&mut self, message: String) {
        if self.register_failure() {
            self.enter_error(message).await;
            return;
        }
        let attempt = self.session.as_ref().map(|s| s.retry_count).unwrap_or(0);
        warn!(
            attempt,
            max_retries = self.config.max_retries,
            error = %message,
            "Step failed; retrying"
        );
        match self.state {
            FsmState::Execute => self.issue_step_call().await,
            FsmState::WaitRefinement => self.spawn_refinement().await,
            _ => debug!(state = %self.state, "Failure in unexpected state"),
        }
    }

    async fn finish_session(&mut self) {
        if let Some(session) = self.session.as_ref() {
            let elapsed = Utc::now().signed_duration_since(session.started_at);
            info!(
                session_id = %session.session_id,
                steps = session.steps.len(),
                elapsed_secs = elapsed.num_seconds(),
                "Session complete"
            );
        }
        self.discard_session().await;
    }

    /// Tear everything down and return to Idle. Generation bump makes any
    /// in-flight sub-task result stale.
    async fn discard_session(&mut self) {
        self.cancel_confirm_timer();
        self.task_generation += 1;
        self.pending = None;
        if let Some(tx) = self.pending_start.take() {
            let _ = tx.send(Err(Error::Session("session start cancelled".to_string())));
        }
        if let Some(client) = self.client.take() {
            client.close().await;
        }
        self.client_events = None;
        self.catalog = None;
        self.session = None;
        self.executed_any = false;
        self.snapshot_stale = false;
        self.last_error = None;
        self.state = FsmState::Idle;
    }

    /// Unrecoverable failure. The connection is closed immediately but the
    /// session data stays visible in status until cancel clears it.
    async fn enter_error(&mut self, message: String) {
        error!(error = %message, "Session entered error state");
        self.cancel_confirm_timer();
        self.task_generation += 1;
        self.pending = None;
        if let Some(tx) = self.pending_start.take() {
            let _ = tx.send(Err(Error::Session(message.clone())));
        }
        if let Some(client) = self.client.take() {
            client.close().await;
        }
        self.client_events = None;
        self.last_error = Some(message);
        self.state = FsmState::Error;
    }

    fn cancel_confirm_timer(&mut self) {
        self.timer_generation += 1;
        if let Some(timer) = self.confirm_timer.take() {
            timer.abort();
        }
    }

    fn arm_call_deadline(&self, request_id: u64) {
        let generation = self.task_generation;
        let timeout = self.config.call_timeout;
        let loop_tx = self.loop_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = loop_tx
                .send(LoopEvent::CallDeadline {
                    generation,
                    request_id,
                })
                .await;
        });
    }

    fn status_snapshot(&self) -> FsmSnapshot {
        let (current, total, steps, to_confirm) = match self.session.as_ref() {
            Some(session) => {
                let current = session.current.map(|i| i as i64).unwrap_or(-1);
                let to_confirm = if self.state == FsmState::WaitConfirm {
                    session
                        .current
                        .and_then(|i| session.steps.get(i))
                        .map(StepView::from)
                } else {
                    None
                };
                (
                    current,
                    session.steps.len(),
                    sequencer::visible_steps(&session.steps),
                    to_confirm,
                )
            }
            None => (-1, 0, Vec::new(), None),
        };
        FsmSnapshot {
            state: self.state,
            current_step_index: current,
            total_steps: total,
            steps,
            step_to_confirm: to_confirm,
            last_error: self.last_error.clone(),
        }
    }
}

async fn plan_session(
    connector: Arc<dyn Connector>,
    parser: Arc<dyn StepParser>,
    instruction: String,
) -> Result<PlannedBundle> {
    let (client, events) = connector.connect().await?;
    let descriptors = client.list_tools().await?;
    let catalog = ToolCatalog::resolve(&descriptors);
    let steps = parser.parse(&instruction, &descriptors).await?;
    debug!(
        steps = steps.len(),
        tools = descriptors.len(),
        "Instruction planned"
    );
    Ok(PlannedBundle {
        session_id: client.session_id().to_string(),
        instruction,
        client,
        events,
        catalog,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Orchestrator, SessionHandle};
    use crate::refine::Refiner;
    use async_trait::async_trait;
    use handrail_core::{Step, UNKNOWN};
    use handrail_protocol::{RpcError, ToolDescriptor};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    const SNAPSHOT_TEXT: &str =
        "Page URL: https://example.com\nPage Snapshot\n- button \"Go\" [ref=s1e3]";

    #[derive(Clone)]
    enum Scripted {
        Ok {
            text: &'static str,
            snapshot: Option<&'static str>,
        },
        ToolError(&'static str),
        RpcFail(i64, &'static str),
        Silent,
    }

    struct FakeSession {
        tools: Vec<ToolDescriptor>,
        events_tx: mpsc::Sender<ClientEvent>,
        outcomes: Arc<StdMutex<VecDeque<Scripted>>>,
        calls: Arc<StdMutex<Vec<String>>>,
        next_id: AtomicU64,
    }

    #[async_trait]
    impl ProtocolSession for FakeSession {
        fn session_id(&self) -> &str {
            "fake-session"
        }

        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
            Ok(self.tools.clone())
        }

        async fn call_tool(&self, name: &str, _arguments: Value) -> Result<u64> {
            self.calls.lock().unwrap().push(name.to_string());
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Scripted::Ok {
                    text: "ok",
                    snapshot: None,
                });
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                let outcome = match outcome {
                    Scripted::Ok { text, snapshot } => Ok(ToolOutput {
                        text: text.to_string(),
                        snapshot: snapshot.map(|s| s.to_string()),
                        is_error: false,
                    }),
                    Scripted::ToolError(message) => Ok(ToolOutput {
                        text: message.to_string(),
                        snapshot: None,
                        is_error: true,
                    }),
                    Scripted::RpcFail(code, message) => Err(RpcError {
                        code,
                        message: message.to_string(),
                    }),
                    Scripted::Silent => return,
                };
                let _ = tx.send(ClientEvent::ToolResult { id, outcome }).await;
            });
            Ok(id)
        }

        async fn close(&self) {}
    }

    struct FakeConnector {
        tools: Vec<&'static str>,
        outcomes: Arc<StdMutex<VecDeque<Scripted>>>,
        calls: Arc<StdMutex<Vec<String>>>,
        events: Arc<StdMutex<Option<mpsc::Sender<ClientEvent>>>>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> Result<(Box<dyn ProtocolSession>, mpsc::Receiver<ClientEvent>)> {
            let (tx, rx) = mpsc::channel(16);
            *self.events.lock().unwrap() = Some(tx.clone());
            let session = FakeSession {
                tools: self
                    .tools
                    .iter()
                    .map(|name| serde_json::from_value(json!({ "name": name })).unwrap())
                    .collect(),
                events_tx: tx,
                outcomes: self.outcomes.clone(),
                calls: self.calls.clone(),
                next_id: AtomicU64::new(1),
            };
            Ok((Box::new(session), rx))
        }
    }

    struct FakeParser {
        steps: Option<Vec<Step>>,
    }

    #[async_trait]
    impl StepParser for FakeParser {
        async fn parse(&self, _instruction: &str, _tools: &[ToolDescriptor]) -> Result<Vec<Step>> {
            match &self.steps {
                Some(steps) => Ok(steps.clone()),
                None => Err(Error::Parse("planner produced no steps".to_string())),
            }
        }
    }

    struct FakeRefiner {
        replies: StdMutex<VecDeque<std::result::Result<String, String>>>,
        delay: Duration,
        seen_excerpts: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Refiner for FakeRefiner {
        async fn refine_arguments(
            &self,
            _tool: LogicalTool,
            _arguments: &Map<String, Value>,
            snapshot_excerpt: &str,
        ) -> Result<String> {
            self.seen_excerpts
                .lock()
                .unwrap()
                .push(snapshot_excerpt.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(reply)) => Ok(reply),
                Some(Err(message)) => Err(Error::Refinement(message)),
                None => Ok("{}".to_string()),
            }
        }
    }

    struct Harness {
        _orchestrator: Orchestrator,
        handle: SessionHandle,
        calls: Arc<StdMutex<Vec<String>>>,
        events: Arc<StdMutex<Option<mpsc::Sender<ClientEvent>>>>,
        refiner: Arc<FakeRefiner>,
    }

    struct HarnessSpec {
        tools: Vec<&'static str>,
        steps: Option<Vec<Step>>,
        outcomes: Vec<Scripted>,
        refiner_replies: Vec<std::result::Result<String, String>>,
        refiner_delay: Duration,
        config: RuntimeConfig,
    }

    impl Default for HarnessSpec {
        fn default() -> Self {
            Self {
                tools: vec!["browser_navigate", "browser_click", "browser_snapshot"],
                steps: Some(vec![nav_step()]),
                outcomes: Vec::new(),
                refiner_replies: Vec::new(),
                refiner_delay: Duration::ZERO,
                config: test_config(),
            }
        }
    }

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            max_retries: 0,
            confirm_timeout: Duration::from_secs(120),
            call_timeout: Duration::from_secs(5),
            snapshot_policy: SnapshotPolicy::OnDemand,
        }
    }

    fn harness(spec: HarnessSpec) -> Harness {
        let outcomes = Arc::new(StdMutex::new(VecDeque::from(spec.outcomes)));
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let events = Arc::new(StdMutex::new(None));
        let connector = Arc::new(FakeConnector {
            tools: spec.tools,
            outcomes,
            calls: calls.clone(),
            events: events.clone(),
        });
        let parser = Arc::new(FakeParser { steps: spec.steps });
        let refiner = Arc::new(FakeRefiner {
            replies: StdMutex::new(VecDeque::from(spec.refiner_replies)),
            delay: spec.refiner_delay,
            seen_excerpts: StdMutex::new(Vec::new()),
        });
        let orchestrator = Orchestrator::new(connector, parser, refiner.clone(), spec.config);
        let handle = orchestrator.handle();
        Harness {
            _orchestrator: orchestrator,
            handle,
            calls,
            events,
            refiner,
        }
    }

    fn args(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    fn nav_step() -> Step {
        Step::new(LogicalTool::Navigate, args(&[("url", "https://example.com")]))
    }

    fn click_step(reference: &str) -> Step {
        Step::new(LogicalTool::Click, args(&[("ref", reference)]))
    }

    fn snapshot_step() -> Step {
        Step::new(LogicalTool::Snapshot, Map::new())
    }

    async fn wait_until(
        handle: &SessionHandle,
        what: &str,
        predicate: impl Fn(&FsmSnapshot) -> bool,
    ) -> FsmSnapshot {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let status = handle.status().await.unwrap();
            if predicate(&status) {
                return status;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {} (state {:?})", what, status.state);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_state(handle: &SessionHandle, want: FsmState) -> FsmSnapshot {
        wait_until(handle, &format!("state {:?}", want), |s| s.state == want).await
    }

    fn recorded(h: &Harness) -> Vec<String> {
        h.calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_single_step_session_runs_to_completion() {
        let h = harness(HarnessSpec {
            outcomes: vec![Scripted::Ok {
                text: "navigated",
                snapshot: None,
            }],
            ..HarnessSpec::default()
        });
        let visible = h.handle.start_session("open example.com").await.unwrap();
        assert_eq!(visible.len(), 1);

        let status = wait_for_state(&h.handle, FsmState::WaitConfirm).await;
        assert_eq!(status.current_step_index, 0);
        assert_eq!(
            status.step_to_confirm.as_ref().unwrap().tool,
            LogicalTool::Navigate
        );

        h.handle.confirm_step().await.unwrap();
        wait_for_state(&h.handle, FsmState::Idle).await;

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.total_steps, 0);
        assert_eq!(status.current_step_index, -1);
        assert!(status.last_error.is_none());
        assert_eq!(recorded(&h), vec!["browser_navigate"]);
    }

    #[tokio::test]
    async fn test_index_advances_monotonically() {
        let h = harness(HarnessSpec {
            steps: Some(vec![nav_step(), click_step("s1e1")]),
            outcomes: vec![
                Scripted::Ok {
                    text: "ok",
                    snapshot: None,
                },
                Scripted::Ok {
                    text: "ok",
                    snapshot: None,
                },
            ],
            ..HarnessSpec::default()
        });
        h.handle.start_session("two steps").await.unwrap();

        let first = wait_for_state(&h.handle, FsmState::WaitConfirm).await;
        assert_eq!(first.current_step_index, 0);
        h.handle.confirm_step().await.unwrap();

        let second = wait_until(&h.handle, "second confirmation", |s| {
            s.state == FsmState::WaitConfirm && s.current_step_index == 1
        })
        .await;
        assert_eq!(
            second.step_to_confirm.as_ref().unwrap().tool,
            LogicalTool::Click
        );
        h.handle.confirm_step().await.unwrap();
        wait_for_state(&h.handle, FsmState::Idle).await;
        assert_eq!(recorded(&h), vec!["browser_navigate", "browser_click"]);
    }

    #[tokio::test]
    async fn test_diagnostic_steps_hidden_and_jumped() {
        let h = harness(HarnessSpec {
            steps: Some(vec![snapshot_step(), nav_step()]),
            outcomes: vec![Scripted::Ok {
                text: "ok",
                snapshot: None,
            }],
            ..HarnessSpec::default()
        });
        let visible = h.handle.start_session("snapshot then navigate").await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].tool, LogicalTool::Navigate);

        let status = wait_for_state(&h.handle, FsmState::WaitConfirm).await;
        assert_eq!(status.total_steps, 2);
        assert_eq!(status.steps.len(), 1);
        assert_eq!(
            status.step_to_confirm.as_ref().unwrap().tool,
            LogicalTool::Navigate
        );

        h.handle.confirm_step().await.unwrap();
        wait_for_state(&h.handle, FsmState::Idle).await;
        // The jumped diagnostic cost nothing: no capture call was made.
        assert_eq!(recorded(&h), vec!["browser_navigate"]);
    }

    #[tokio::test]
    async fn test_confirm_outside_wait_confirm_is_noop() {
        let h = harness(HarnessSpec::default());
        h.handle.confirm_step().await.unwrap();
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, FsmState::Idle);
        assert!(recorded(&h).is_empty());
    }

    #[tokio::test]
    async fn test_first_failure_terminal_with_zero_retries() {
        let h = harness(HarnessSpec {
            outcomes: vec![Scripted::ToolError("element not found")],
            ..HarnessSpec::default()
        });
        h.handle.start_session("will fail").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;
        h.handle.confirm_step().await.unwrap();

        let status = wait_for_state(&h.handle, FsmState::Error).await;
        assert!(status.last_error.as_ref().unwrap().contains("element not found"));
        assert_eq!(recorded(&h).len(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_reattempts_then_errors() {
        let mut config = test_config();
        config.max_retries = 1;
        let h = harness(HarnessSpec {
            outcomes: vec![
                Scripted::ToolError("boom"),
                Scripted::ToolError("boom again"),
            ],
            config,
            ..HarnessSpec::default()
        });
        h.handle.start_session("retry once").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;
        h.handle.confirm_step().await.unwrap();

        let status = wait_for_state(&h.handle, FsmState::Error).await;
        assert!(status.last_error.as_ref().unwrap().contains("boom again"));
        assert_eq!(recorded(&h).len(), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_allows_recovery() {
        let mut config = test_config();
        config.max_retries = 1;
        let h = harness(HarnessSpec {
            outcomes: vec![
                Scripted::RpcFail(-32000, "transient"),
                Scripted::Ok {
                    text: "ok",
                    snapshot: None,
                },
            ],
            config,
            ..HarnessSpec::default()
        });
        h.handle.start_session("recovers").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;
        h.handle.confirm_step().await.unwrap();

        wait_for_state(&h.handle, FsmState::Idle).await;
        let status = h.handle.status().await.unwrap();
        assert!(status.last_error.is_none());
        assert_eq!(recorded(&h).len(), 2);
    }

    #[tokio::test]
    async fn test_refinement_runs_between_execution_and_confirmation() {
        let h = harness(HarnessSpec {
            steps: Some(vec![nav_step(), click_step(UNKNOWN)]),
            outcomes: vec![
                Scripted::Ok {
                    text: "navigated",
                    snapshot: Some(SNAPSHOT_TEXT),
                },
                Scripted::Ok {
                    text: "clicked",
                    snapshot: None,
                },
            ],
            refiner_replies: vec![Ok(r#"{"ref":"s1e3"}"#.to_string())],
            refiner_delay: Duration::from_millis(100),
            ..HarnessSpec::default()
        });
        h.handle.start_session("navigate then click").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;
        h.handle.confirm_step().await.unwrap();

        wait_for_state(&h.handle, FsmState::WaitRefinement).await;
        let status = wait_until(&h.handle, "refined confirmation", |s| {
            s.state == FsmState::WaitConfirm && s.current_step_index == 1
        })
        .await;
        let to_confirm = status.step_to_confirm.as_ref().unwrap();
        assert_eq!(to_confirm.arguments.get("ref"), Some(&json!("s1e3")));

        h.handle.confirm_step().await.unwrap();
        wait_for_state(&h.handle, FsmState::Idle).await;

        let excerpts = h.refiner.seen_excerpts.lock().unwrap();
        assert_eq!(excerpts.len(), 1);
        assert!(excerpts[0].contains("ref=s1e3"));
        assert_eq!(recorded(&h), vec!["browser_navigate", "browser_click"]);
    }

    #[tokio::test]
    async fn test_empty_parse_never_starts_session() {
        let h = harness(HarnessSpec {
            steps: None,
            ..HarnessSpec::default()
        });
        let err = h.handle.start_session("unplannable").await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)));

        let status = wait_for_state(&h.handle, FsmState::Error).await;
        assert_eq!(status.total_steps, 0);
        assert!(status.last_error.as_ref().unwrap().contains("no steps"));

        h.handle.cancel_session().await.unwrap();
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, FsmState::Idle);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_confirmation_timeout_discards_session() {
        let mut config = test_config();
        config.confirm_timeout = Duration::from_millis(200);
        let h = harness(HarnessSpec {
            config,
            ..HarnessSpec::default()
        });
        h.handle.start_session("never confirmed").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;

        let status = wait_for_state(&h.handle, FsmState::Idle).await;
        assert_eq!(status.total_steps, 0);
        assert!(status.last_error.is_none());
        assert!(recorded(&h).is_empty());
    }

    #[tokio::test]
    async fn test_unmapped_tool_fails_without_network() {
        let h = harness(HarnessSpec {
            tools: vec!["browser_navigate"],
            steps: Some(vec![click_step("s1e1")]),
            ..HarnessSpec::default()
        });
        h.handle.start_session("click something").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;
        h.handle.confirm_step().await.unwrap();

        let status = wait_for_state(&h.handle, FsmState::Error).await;
        assert!(status
            .last_error
            .as_ref()
            .unwrap()
            .contains("no advertised tool"));
        assert!(recorded(&h).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_discards_active_session() {
        let h = harness(HarnessSpec {
            outcomes: vec![Scripted::Silent],
            ..HarnessSpec::default()
        });
        h.handle.start_session("cancel me").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;
        h.handle.confirm_step().await.unwrap();

        h.handle.cancel_session().await.unwrap();
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, FsmState::Idle);
        assert_eq!(status.total_steps, 0);
    }

    #[tokio::test]
    async fn test_cancel_during_refinement_ignores_late_result() {
        let h = harness(HarnessSpec {
            steps: Some(vec![nav_step(), click_step(UNKNOWN)]),
            outcomes: vec![Scripted::Ok {
                text: "ok",
                snapshot: Some(SNAPSHOT_TEXT),
            }],
            refiner_replies: vec![Ok(r#"{"ref":"s1e3"}"#.to_string())],
            refiner_delay: Duration::from_millis(200),
            ..HarnessSpec::default()
        });
        h.handle.start_session("slow refinement").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;
        h.handle.confirm_step().await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitRefinement).await;

        h.handle.cancel_session().await.unwrap();
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, FsmState::Idle);

        // The refinement completes against a bumped generation and must not
        // resurrect the session.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, FsmState::Idle);
        assert_eq!(status.total_steps, 0);
    }

    #[tokio::test]
    async fn test_each_step_policy_captures_between_steps() {
        let mut config = test_config();
        config.snapshot_policy = SnapshotPolicy::EachStep;
        let h = harness(HarnessSpec {
            steps: Some(vec![nav_step(), click_step("s1e1")]),
            outcomes: vec![
                Scripted::Ok {
                    text: "navigated",
                    snapshot: None,
                },
                Scripted::Ok {
                    text: "",
                    snapshot: Some(SNAPSHOT_TEXT),
                },
                Scripted::Ok {
                    text: "clicked",
                    snapshot: None,
                },
            ],
            config,
            ..HarnessSpec::default()
        });
        h.handle.start_session("capture between").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;
        h.handle.confirm_step().await.unwrap();

        wait_until(&h.handle, "second confirmation", |s| {
            s.state == FsmState::WaitConfirm && s.current_step_index == 1
        })
        .await;
        h.handle.confirm_step().await.unwrap();
        wait_for_state(&h.handle, FsmState::Idle).await;

        assert_eq!(
            recorded(&h),
            vec!["browser_navigate", "browser_snapshot", "browser_click"]
        );
    }

    #[tokio::test]
    async fn test_on_demand_capture_before_refinement() {
        let h = harness(HarnessSpec {
            steps: Some(vec![nav_step(), click_step(UNKNOWN)]),
            outcomes: vec![
                Scripted::Ok {
                    text: "navigated",
                    snapshot: None,
                },
                Scripted::Ok {
                    text: "",
                    snapshot: Some(SNAPSHOT_TEXT),
                },
                Scripted::Ok {
                    text: "clicked",
                    snapshot: None,
                },
            ],
            refiner_replies: vec![Ok(r#"{"ref":"s1e3"}"#.to_string())],
            ..HarnessSpec::default()
        });
        h.handle.start_session("capture on demand").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;
        h.handle.confirm_step().await.unwrap();

        wait_until(&h.handle, "refined confirmation", |s| {
            s.state == FsmState::WaitConfirm && s.current_step_index == 1
        })
        .await;
        h.handle.confirm_step().await.unwrap();
        wait_for_state(&h.handle, FsmState::Idle).await;

        assert_eq!(
            recorded(&h),
            vec!["browser_navigate", "browser_snapshot", "browser_click"]
        );
    }

    #[tokio::test]
    async fn test_jumped_diagnostic_forces_fresh_capture() {
        let h = harness(HarnessSpec {
            steps: Some(vec![nav_step(), snapshot_step(), click_step(UNKNOWN)]),
            outcomes: vec![
                Scripted::Ok {
                    text: "navigated",
                    snapshot: Some("Page URL: https://old.example.com\n- link [ref=s0e1]"),
                },
                Scripted::Ok {
                    text: "",
                    snapshot: Some("Page URL: https://fresh.example.com\n- button [ref=s1e9]"),
                },
                Scripted::Ok {
                    text: "clicked",
                    snapshot: None,
                },
            ],
            refiner_replies: vec![Ok(r#"{"ref":"s1e9"}"#.to_string())],
            ..HarnessSpec::default()
        });
        h.handle.start_session("stale snapshot").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;
        h.handle.confirm_step().await.unwrap();

        wait_until(&h.handle, "refined confirmation", |s| {
            s.state == FsmState::WaitConfirm && s.current_step_index == 2
        })
        .await;
        h.handle.confirm_step().await.unwrap();
        wait_for_state(&h.handle, FsmState::Idle).await;

        // The held snapshot was stale after the jumped diagnostic, so the
        // refiner must have seen the freshly captured page.
        let excerpts = h.refiner.seen_excerpts.lock().unwrap();
        assert_eq!(excerpts.len(), 1);
        assert!(excerpts[0].contains("fresh.example.com"));
        assert_eq!(
            recorded(&h),
            vec!["browser_navigate", "browser_snapshot", "browser_click"]
        );
    }

    #[tokio::test]
    async fn test_first_step_refinement_without_snapshot_is_error() {
        let h = harness(HarnessSpec {
            steps: Some(vec![click_step(UNKNOWN)]),
            ..HarnessSpec::default()
        });
        h.handle.start_session("click blind").await.unwrap();

        let status = wait_for_state(&h.handle, FsmState::Error).await;
        assert!(status
            .last_error
            .as_ref()
            .unwrap()
            .contains("no page snapshot"));
        assert!(recorded(&h).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_enters_error() {
        let h = harness(HarnessSpec::default());
        h.handle.start_session("disconnect").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;

        let tx = h.events.lock().unwrap().clone().unwrap();
        tx.send(ClientEvent::Disconnected {
            reason: "stream ended".to_string(),
        })
        .await
        .unwrap();

        let status = wait_for_state(&h.handle, FsmState::Error).await;
        assert!(status
            .last_error
            .as_ref()
            .unwrap()
            .contains("connection lost"));
    }

    #[tokio::test]
    async fn test_unmatched_tool_result_is_dropped() {
        let h = harness(HarnessSpec::default());
        h.handle.start_session("spurious result").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;

        // No request is pending, so a stray result must not move the FSM.
        let tx = h.events.lock().unwrap().clone().unwrap();
        tx.send(ClientEvent::ToolResult {
            id: 999,
            outcome: Ok(ToolOutput {
                text: "late".to_string(),
                snapshot: None,
                is_error: false,
            }),
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, FsmState::WaitConfirm);
        assert_eq!(status.current_step_index, 0);
        assert!(recorded(&h).is_empty());
    }

    #[tokio::test]
    async fn test_start_rejected_while_session_active() {
        let h = harness(HarnessSpec::default());
        h.handle.start_session("first").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;

        let err = h.handle.start_session("second").await.unwrap_err();
        assert!(err.to_string().contains("already active"));
    }

    #[tokio::test]
    async fn test_reject_discards_session() {
        let h = harness(HarnessSpec::default());
        h.handle.start_session("rejected").await.unwrap();
        wait_for_state(&h.handle, FsmState::WaitConfirm).await;

        h.handle.reject_steps().await.unwrap();
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, FsmState::Idle);
        assert_eq!(status.total_steps, 0);
        assert!(recorded(&h).is_empty());
    }
}
