use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use handrail_core::{Error, Result, StepView};

use crate::connect::Connector;
use crate::events::SessionCommand;
use crate::parser::StepParser;
use crate::refine::{Refiner, RefinementBridge};
use crate::runtime::{RuntimeConfig, SessionRuntime};
use crate::session::FsmSnapshot;

/// Owns the runtime task. Dropping the orchestrator aborts it.
pub struct Orchestrator {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

impl Orchestrator {
    pub fn new(
        connector: Arc<dyn Connector>,
        parser: Arc<dyn StepParser>,
        refiner: Arc<dyn Refiner>,
        config: RuntimeConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let runtime = SessionRuntime::new(
            config,
            connector,
            parser,
            RefinementBridge::new(refiner),
            rx,
        );
        let task = tokio::spawn(runtime.run());
        Self {
            handle: SessionHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Cheap clonable handle; every caller (CLI loop, gateway routes) talks to
/// the same runtime task through it.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Plan a session from a natural-language instruction. Returns the
    /// user-visible steps; the runtime then waits for confirmation of the
    /// first one.
    pub async fn start_session(&self, instruction: &str) -> Result<Vec<StepView>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Start {
                instruction: instruction.to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::Session("orchestrator stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Session("orchestrator dropped the request".to_string()))?
    }

    /// Approve the step currently awaiting confirmation.
    pub async fn confirm_step(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Confirm { reply })
            .await
            .map_err(|_| Error::Session("orchestrator stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Session("orchestrator dropped the request".to_string()))?
    }

    /// Reject the pending step and discard the whole session.
    pub async fn reject_steps(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Reject { reply })
            .await
            .map_err(|_| Error::Session("orchestrator stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Session("orchestrator dropped the request".to_string()))?
    }

    /// Cancel whatever is in progress; also clears a sticky error state.
    pub async fn cancel_session(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Cancel { reply })
            .await
            .map_err(|_| Error::Session("orchestrator stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Session("orchestrator dropped the request".to_string()))?
    }

    pub async fn status(&self) -> Result<FsmSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Status { reply })
            .await
            .map_err(|_| Error::Session("orchestrator stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Session("orchestrator dropped the request".to_string()))
    }
}
