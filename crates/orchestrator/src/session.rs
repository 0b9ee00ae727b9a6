//! Session state types and the status payload.

use chrono::{DateTime, Utc};
use serde::Serialize;

use handrail_core::{Step, StepView};

/// Lifecycle states of the orchestrator.
///
/// `Idle` is both initial and terminal: a completed, rejected, cancelled or
/// timed-out session lands back here with nothing retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FsmState {
    Idle,
    WaitConfirm,
    Execute,
    WaitRefinement,
    Error,
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FsmState::Idle => "idle",
            FsmState::WaitConfirm => "wait_confirm",
            FsmState::Execute => "execute",
            FsmState::WaitRefinement => "wait_refinement",
            FsmState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// One plan in flight against one remote session.
///
/// Steps are immutable after parsing except for one mutation: refinement
/// replaces a single step's arguments wholesale.
#[derive(Debug)]
pub struct Session {
    /// Issued by the remote server during the endpoint handshake.
    pub session_id: String,
    pub instruction: String,
    pub steps: Vec<Step>,
    pub current: Option<usize>,
    /// Most recent page-state dump, from execution responses or diagnostic
    /// captures.
    pub latest_snapshot: Option<String>,
    /// Consecutive failures of the current step; reset whenever a new step
    /// becomes current, on confirmation, and on refinement success.
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time status answer, also the gateway's JSON payload.
///
/// Diagnostic steps are filtered out of `steps`; clients correlate by step
/// id, never by index into the filtered list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsmSnapshot {
    pub state: FsmState,
    /// Index into the raw step list; -1 before the first selection or when
    /// no session is active.
    pub current_step_index: i64,
    pub total_steps: usize,
    pub steps: Vec<StepView>,
    pub step_to_confirm: Option<StepView>,
    pub last_error: Option<String>,
}
