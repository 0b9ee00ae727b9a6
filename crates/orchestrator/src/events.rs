//! Messages flowing into the runtime's event loop.

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use handrail_core::{Result, Step, StepView};
use handrail_protocol::{ClientEvent, ProtocolSession, ToolCatalog};

use crate::session::FsmSnapshot;

/// Public commands, sent by [`crate::handle::SessionHandle`].
pub enum SessionCommand {
    Start {
        instruction: String,
        reply: oneshot::Sender<Result<Vec<StepView>>>,
    },
    Confirm {
        reply: oneshot::Sender<Result<()>>,
    },
    Reject {
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<FsmSnapshot>,
    },
}

/// Completions posted back by spawned sub-tasks and timers. Every variant
/// carries enough to detect staleness: results for a discarded session must
/// never apply to a later one.
pub enum LoopEvent {
    Planned {
        generation: u64,
        result: Result<PlannedBundle>,
    },
    Refined {
        generation: u64,
        step_id: String,
        result: Result<Map<String, Value>>,
    },
    ConfirmTimeout {
        generation: u64,
    },
    CallDeadline {
        generation: u64,
        request_id: u64,
    },
}

/// Everything the planning sub-task produces: a connected session, the
/// resolved catalog, and the parsed plan.
pub struct PlannedBundle {
    pub session_id: String,
    pub instruction: String,
    pub client: Box<dyn ProtocolSession>,
    pub events: mpsc::Receiver<ClientEvent>,
    pub catalog: ToolCatalog,
    pub steps: Vec<Step>,
}
