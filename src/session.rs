//! Turn controller and the caller-facing session API.
//!
//! A session alternates between asking the model for its next message and
//! dispatching the actions that message requests, one at a time and in the
//! order requested, until the model answers without actions, a budget runs
//! out, the model service gives up, or the caller cancels.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::brain::{AnthropicClient, ModelRequest, ModelService, Resilient};
use crate::cliclick::Cliclick;
use crate::config::AgentConfig;
use crate::display::DisplayProfile;
use crate::error::{BudgetExceeded, DispatchError};
use crate::events::{EventKind, SessionEvent};
use crate::hands::Dispatcher;
use crate::screen::{ScreencaptureCli, ScreenshotProvider, save_artifact};
use crate::types::{ActionCatalog, ActionResult, ImageArtifact, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingModel,
    ExecutingActions,
    Done,
    Failed,
    Cancelled,
}

/// Everything one run of the loop owns. Only the turn controller appends
/// to the history.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    profile: DisplayProfile,
    catalog: ActionCatalog,
    history: Vec<Message>,
    state: LoopState,
    turns: u32,
    tokens_used: u64,
    last_screenshot: Option<ImageArtifact>,
}

impl Session {
    pub fn new(id: Uuid, profile: DisplayProfile, request: impl Into<String>) -> Self {
        Self {
            id,
            profile,
            catalog: ActionCatalog::new(profile.logical()),
            history: vec![Message::User {
                text: request.into(),
            }],
            state: LoopState::AwaitingModel,
            turns: 0,
            tokens_used: 0,
            last_screenshot: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn profile(&self) -> &DisplayProfile {
        &self.profile
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed { final_text: String },
    /// Ends as done, with the budget as a warning.
    BudgetExhausted {
        reason: BudgetExceeded,
        final_text: String,
    },
    Cancelled,
    Failed { error: String },
}

impl SessionOutcome {
    fn state(&self) -> LoopState {
        match self {
            SessionOutcome::Completed { .. } | SessionOutcome::BudgetExhausted { .. } => {
                LoopState::Done
            }
            SessionOutcome::Cancelled => LoopState::Cancelled,
            SessionOutcome::Failed { .. } => LoopState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub id: Uuid,
    pub outcome: SessionOutcome,
    pub turns: u32,
    pub tokens_used: u64,
    /// Last screen state, saved when the session did not complete normally.
    pub screenshot: Option<PathBuf>,
}

pub struct TurnController {
    model: Arc<dyn ModelService>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<AgentConfig>,
    events: broadcast::Sender<SessionEvent>,
}

impl TurnController {
    pub fn new(
        model: Arc<dyn ModelService>,
        dispatcher: Arc<Dispatcher>,
        config: Arc<AgentConfig>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            model,
            dispatcher,
            config,
            events,
        }
    }

    /// Drives `session` to a terminal state. Held inputs are released
    /// before the terminal event goes out.
    pub async fn run(&self, session: &mut Session, cancel: &CancellationToken) -> SessionReport {
        info!("[session] {} started on {}", session.id, session.profile.logical());
        let outcome = self.turns(session, cancel).await;
        session.state = outcome.state();

        if let Err(e) = self.dispatcher.release_all().await {
            warn!("[session] {} could not release held inputs: {}", session.id, e);
        }

        let screenshot = match outcome {
            SessionOutcome::Completed { .. } => None,
            _ => self.persist_screenshot(session).await,
        };

        let kind = match &outcome {
            SessionOutcome::Completed { final_text } => {
                info!("[session] {} done after {} turns", session.id, session.turns);
                EventKind::Done {
                    final_text: final_text.clone(),
                    warning: None,
                    screenshot: None,
                }
            }
            SessionOutcome::BudgetExhausted { reason, final_text } => {
                warn!("[session] {} stopped: {}", session.id, reason);
                EventKind::Done {
                    final_text: final_text.clone(),
                    warning: Some(reason.to_string()),
                    screenshot: screenshot.clone(),
                }
            }
            SessionOutcome::Cancelled => {
                info!("[session] {} cancelled", session.id);
                EventKind::Cancelled {
                    screenshot: screenshot.clone(),
                }
            }
            SessionOutcome::Failed { error } => {
                error!("[session] {} failed: {}", session.id, error);
                EventKind::Failed {
                    message: error.clone(),
                    screenshot: screenshot.clone(),
                }
            }
        };
        self.emit(session.id, kind);

        SessionReport {
            id: session.id,
            outcome,
            turns: session.turns,
            tokens_used: session.tokens_used,
            screenshot,
        }
    }

    async fn turns(&self, session: &mut Session, cancel: &CancellationToken) -> SessionOutcome {
        let mut final_text = String::new();

        'turns: loop {
            if cancel.is_cancelled() {
                break SessionOutcome::Cancelled;
            }
            if let Some(reason) = self.exhausted_budget(session) {
                break SessionOutcome::BudgetExhausted { reason, final_text };
            }

            session.turns += 1;
            session.state = LoopState::AwaitingModel;
            self.emit(session.id, EventKind::TurnStarted { turn: session.turns });

            let request = ModelRequest {
                system: &self.config.system_prompt,
                catalog: &session.catalog,
                history: &session.history,
            };
            let response = tokio::select! {
                response = self.model.respond(&request) => Some(response),
                _ = cancel.cancelled() => None,
            };
            let Some(response) = response else {
                break SessionOutcome::Cancelled;
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => break SessionOutcome::Failed { error: e.to_string() },
            };

            session.tokens_used += response.usage.total();
            let text = response.text();
            if !text.is_empty() {
                info!("[session] model: {}", text);
                self.emit(session.id, EventKind::ModelText { text: text.clone() });
                final_text = text.clone();
            }

            let requests = response.action_requests();
            session.history.push(Message::Model {
                content: response.content,
            });
            if requests.is_empty() {
                break SessionOutcome::Completed { final_text: text };
            }

            session.state = LoopState::ExecutingActions;
            for request in requests {
                if cancel.is_cancelled() {
                    break 'turns SessionOutcome::Cancelled;
                }
                self.emit(
                    session.id,
                    EventKind::ActionDispatched {
                        id: request.id.clone(),
                        action: action_label(&request.input),
                        input: request.input.clone(),
                    },
                );

                let result = if request.name == session.catalog.tool_name {
                    self.dispatcher
                        .execute_input(&request.input, &session.profile, cancel)
                        .await
                } else {
                    ActionResult::failure(format!(
                        "unknown tool '{}', only '{}' is available",
                        request.name, session.catalog.tool_name
                    ))
                };

                if let Some(image) = &result.image {
                    session.last_screenshot = Some(image.clone());
                }
                self.emit(
                    session.id,
                    EventKind::ActionResult {
                        id: request.id.clone(),
                        output: result.output.clone(),
                        error: result.error.clone(),
                        has_image: result.image.is_some(),
                    },
                );
                session.history.push(Message::ToolResult {
                    tool_use_id: request.id,
                    result,
                });
            }
        }
    }

    fn exhausted_budget(&self, session: &Session) -> Option<BudgetExceeded> {
        if session.turns >= self.config.max_turns {
            return Some(BudgetExceeded::Turns {
                limit: self.config.max_turns,
            });
        }
        match self.config.token_budget {
            Some(limit) if session.tokens_used >= limit => Some(BudgetExceeded::Tokens {
                used: session.tokens_used,
                limit,
            }),
            _ => None,
        }
    }

    async fn persist_screenshot(&self, session: &Session) -> Option<PathBuf> {
        let dir = self.config.screenshot_dir.as_ref()?;
        let image = session.last_screenshot.as_ref()?;
        let stem = format!("session-{}", session.id.simple());
        match save_artifact(image, dir, &stem).await {
            Ok(path) => {
                info!("[session] last screen saved to {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("[session] could not save last screenshot: {}", e);
                None
            }
        }
    }

    fn emit(&self, session_id: Uuid, kind: EventKind) {
        let _ = self.events.send(SessionEvent { session_id, kind });
    }
}

fn action_label(input: &Value) -> String {
    input["action"].as_str().unwrap_or("unknown").to_string()
}

/// Handle to a running session.
pub struct SessionHandle {
    id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stops the session at the next action boundary. Suspensions in
    /// progress (settle, wait, hold) end early.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn join(self) -> Result<SessionReport, JoinError> {
        self.task.await
    }
}

/// Owns the collaborators shared by every session on one display.
#[derive(Clone)]
pub struct Agent {
    config: Arc<AgentConfig>,
    model: Arc<dyn ModelService>,
    dispatcher: Arc<Dispatcher>,
    events: broadcast::Sender<SessionEvent>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        model: Arc<dyn ModelService>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config: Arc::new(config),
            model,
            dispatcher,
            events,
        }
    }

    /// The Anthropic client, `cliclick` and `screencapture`.
    pub fn for_macos(config: AgentConfig) -> Self {
        let model = Resilient::new(
            AnthropicClient::from_config(&config),
            config.retry.clone(),
            config.turn_timeout,
        );
        let screen = ScreenshotProvider::new(Arc::new(ScreencaptureCli::new()), config.retry.clone());
        let dispatcher = Dispatcher::new(
            Arc::new(Cliclick::new()),
            screen,
            config.dispatch_settings(),
        );
        Self::new(config, Arc::new(model), Arc::new(dispatcher))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Status events of every session this agent starts.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Measures the display, then runs the loop on a new task. Subscribe
    /// first to see every event.
    pub async fn start_session(
        &self,
        request: impl Into<String>,
    ) -> Result<SessionHandle, DispatchError> {
        self.launch(request.into(), self.config.clone()).await
    }

    /// Like [`Agent::start_session`] with a per-session configuration.
    /// Dispatch settings stay those the agent was built with, since the
    /// dispatcher is shared.
    pub async fn start_session_with(
        &self,
        request: impl Into<String>,
        config: AgentConfig,
    ) -> Result<SessionHandle, DispatchError> {
        self.launch(request.into(), Arc::new(config)).await
    }

    async fn launch(
        &self,
        request: String,
        config: Arc<AgentConfig>,
    ) -> Result<SessionHandle, DispatchError> {
        let profile = self.dispatcher.display_profile(config.scaling).await?;
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let mut session = Session::new(id, profile, request);
        let controller = TurnController::new(
            self.model.clone(),
            self.dispatcher.clone(),
            config,
            self.events.clone(),
        );

        let token = cancel.clone();
        let task = tokio::spawn(async move { controller.run(&mut session, &token).await });
        Ok(SessionHandle { id, cancel, task })
    }

    /// Runs one raw computer-tool input outside any session, through the
    /// same dispatcher and display lock.
    pub async fn execute_direct(&self, input: &Value) -> Result<ActionResult, DispatchError> {
        let profile = self.dispatcher.display_profile(self.config.scaling).await?;
        Ok(self
            .dispatcher
            .execute_input(input, &profile, &CancellationToken::new())
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::Resolution;
    use serde_json::json;

    #[test]
    fn new_session_starts_with_the_request() {
        let profile = DisplayProfile::detect(Resolution::new(2560, 1600), true).unwrap();
        let session = Session::new(Uuid::nil(), profile, "open Safari");
        assert_eq!(session.state(), LoopState::AwaitingModel);
        assert_eq!(session.catalog.display, Resolution::new(1280, 800));
        assert_eq!(
            session.history(),
            &[Message::User {
                text: "open Safari".into()
            }]
        );
    }

    #[test]
    fn outcome_maps_to_terminal_state() {
        let budget = SessionOutcome::BudgetExhausted {
            reason: BudgetExceeded::Turns { limit: 3 },
            final_text: String::new(),
        };
        assert_eq!(budget.state(), LoopState::Done);
        assert_eq!(SessionOutcome::Cancelled.state(), LoopState::Cancelled);
        assert_eq!(
            SessionOutcome::Failed {
                error: "x".into()
            }
            .state(),
            LoopState::Failed
        );
    }

    #[test]
    fn action_label_reads_the_action_field() {
        assert_eq!(action_label(&json!({"action": "wait"})), "wait");
        assert_eq!(action_label(&json!(42)), "unknown");
    }
}
