//! Status events a session emits for whatever is rendering it.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TurnStarted {
        turn: u32,
    },
    ModelText {
        text: String,
    },
    ActionDispatched {
        id: String,
        action: String,
        input: Value,
    },
    ActionResult {
        id: String,
        output: String,
        error: Option<String>,
        has_image: bool,
    },
    Done {
        final_text: String,
        /// Set when a budget rather than the model ended the session.
        warning: Option<String>,
        screenshot: Option<PathBuf>,
    },
    Failed {
        message: String,
        screenshot: Option<PathBuf>,
    },
    Cancelled {
        screenshot: Option<PathBuf>,
    },
}

impl EventKind {
    /// Event name used on the SSE stream.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TurnStarted { .. } => "turn_started",
            EventKind::ModelText { .. } => "model_text",
            EventKind::ActionDispatched { .. } => "action_dispatched",
            EventKind::ActionResult { .. } => "action_result",
            EventKind::Done { .. } => "done",
            EventKind::Failed { .. } => "failed",
            EventKind::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Done { .. } | EventKind::Failed { .. } | EventKind::Cancelled { .. }
        )
    }
}
