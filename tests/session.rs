mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{LoopingModel, Rig, ScriptedModel, reply, text, tool_use};
use mac_computer_control::error::{BudgetExceeded, ModelServiceError};
use mac_computer_control::retry::RetryPolicy;
use mac_computer_control::session::TurnController;
use mac_computer_control::types::Message;
use mac_computer_control::{
    Agent, AgentConfig, EventKind, LoopState, Primitive, Resilient, Resolution, Session,
    SessionEvent, SessionOutcome,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SMALL: Resolution = Resolution::new(320, 200);

fn config() -> AgentConfig {
    AgentConfig {
        screenshot_dir: None,
        ..AgentConfig::default()
    }
}

fn controller(
    rig: &Rig,
    model: Arc<dyn mac_computer_control::ModelService>,
    config: AgentConfig,
) -> (TurnController, broadcast::Receiver<SessionEvent>) {
    let (events, rx) = broadcast::channel(256);
    let controller = TurnController::new(model, rig.dispatcher.clone(), Arc::new(config), events);
    (controller, rx)
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

#[tokio::test(start_paused = true)]
async fn tool_results_keep_request_ids_in_order() {
    let rig = Rig::new(SMALL);
    let model = Arc::new(ScriptedModel::new(vec![
        Ok(reply(vec![
            text("Moving, clicking, then pressing return"),
            tool_use("toolu_a", json!({"action": "mouse_move", "coordinate": [10, 10]})),
            tool_use("toolu_b", json!({"action": "left_click"})),
            tool_use("toolu_c", json!({"action": "key", "text": "Return"})),
        ])),
        Ok(reply(vec![text("All done")])),
    ]));
    let (controller, _rx) = controller(&rig, model.clone(), config());
    let mut session = Session::new(Uuid::new_v4(), rig.profile, "submit the form");

    let report = controller.run(&mut session, &CancellationToken::new()).await;

    assert_eq!(
        report.outcome,
        SessionOutcome::Completed {
            final_text: "All done".into()
        }
    );
    assert_eq!(session.state(), LoopState::Done);
    let ids: Vec<&str> = session
        .history()
        .iter()
        .filter_map(|m| match m {
            Message::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(ids, vec!["toolu_a", "toolu_b", "toolu_c"]);
    // user, model, three results, model
    assert_eq!(session.history().len(), 6);
    assert_eq!(model.history_lengths(), vec![1, 5]);
    assert_eq!(rig.driver.batches().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn text_only_answer_finishes_without_dispatch() {
    let rig = Rig::new(SMALL);
    let model = Arc::new(ScriptedModel::new(vec![Ok(reply(vec![text(
        "The Dock is already visible.",
    )]))]));
    let (controller, mut rx) = controller(&rig, model.clone(), config());
    let mut session = Session::new(Uuid::new_v4(), rig.profile, "is the dock visible?");

    let report = controller.run(&mut session, &CancellationToken::new()).await;

    assert_eq!(
        report.outcome,
        SessionOutcome::Completed {
            final_text: "The Dock is already visible.".into()
        }
    );
    assert_eq!(report.turns, 1);
    assert_eq!(model.calls(), 1);
    assert!(rig.driver.batches().is_empty());
    assert_eq!(rig.capturer.captures(), 0);

    let kinds = drain(&mut rx);
    assert!(matches!(kinds[0], EventKind::TurnStarted { turn: 1 }));
    assert!(matches!(kinds.last(), Some(EventKind::Done { warning: None, .. })));
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_turn_stops_dispatch_and_releases_the_button() {
    let rig = Rig::new(SMALL);
    let model = Arc::new(ScriptedModel::new(vec![Ok(reply(vec![
        tool_use("toolu_1", json!({"action": "left_mouse_down"})),
        tool_use("toolu_2", json!({"action": "wait", "duration": 10})),
        tool_use("toolu_3", json!({"action": "left_click"})),
    ]))]));
    let (controller, mut rx) = controller(&rig, model.clone(), config());
    let mut session = Session::new(Uuid::new_v4(), rig.profile, "drag something");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        trigger.cancel();
    });

    let report = controller.run(&mut session, &cancel).await;

    assert_eq!(report.outcome, SessionOutcome::Cancelled);
    assert_eq!(session.state(), LoopState::Cancelled);
    assert_eq!(model.calls(), 1);

    let primitives = rig.driver.primitives();
    assert!(
        !primitives
            .iter()
            .any(|p| matches!(p, Primitive::Click { .. })),
        "click dispatched after cancel: {primitives:?}"
    );
    assert_eq!(
        rig.driver.batches().last(),
        Some(&vec![Primitive::ButtonUp(None)])
    );
    assert!(!session.history().iter().any(|m| matches!(
        m,
        Message::ToolResult { tool_use_id, .. } if tool_use_id == "toolu_3"
    )));

    let kinds = drain(&mut rx);
    assert!(matches!(kinds.last(), Some(EventKind::Cancelled { .. })));
}

#[tokio::test(start_paused = true)]
async fn cancel_before_start_never_calls_the_model() {
    let rig = Rig::new(SMALL);
    let model = Arc::new(ScriptedModel::new(Vec::new()));
    let (controller, _rx) = controller(&rig, model.clone(), config());
    let mut session = Session::new(Uuid::new_v4(), rig.profile, "anything");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = controller.run(&mut session, &cancel).await;

    assert_eq!(report.outcome, SessionOutcome::Cancelled);
    assert_eq!(model.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn turn_budget_ends_as_done_with_warning() {
    let rig = Rig::new(SMALL);
    let model = Arc::new(LoopingModel::new(json!({"action": "wait", "duration": 0}), 0));
    let cfg = AgentConfig {
        max_turns: 2,
        ..config()
    };
    let (controller, mut rx) = controller(&rig, model.clone(), cfg);
    let mut session = Session::new(Uuid::new_v4(), rig.profile, "keep waiting");

    let report = controller.run(&mut session, &CancellationToken::new()).await;

    assert_eq!(
        report.outcome,
        SessionOutcome::BudgetExhausted {
            reason: BudgetExceeded::Turns { limit: 2 },
            final_text: String::new(),
        }
    );
    assert_eq!(session.state(), LoopState::Done);
    assert_eq!(model.calls(), 2);
    match drain(&mut rx).last() {
        Some(EventKind::Done { warning, .. }) => {
            assert_eq!(warning.as_deref(), Some("turn budget of 2 exhausted"));
        }
        other => panic!("expected done event, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn token_budget_is_checked_between_turns() {
    let rig = Rig::new(SMALL);
    let model = Arc::new(LoopingModel::new(json!({"action": "wait", "duration": 0}), 600));
    let cfg = AgentConfig {
        token_budget: Some(1000),
        ..config()
    };
    let (controller, _rx) = controller(&rig, model.clone(), cfg);
    let mut session = Session::new(Uuid::new_v4(), rig.profile, "keep waiting");

    let report = controller.run(&mut session, &CancellationToken::new()).await;

    assert_eq!(
        report.outcome,
        SessionOutcome::BudgetExhausted {
            reason: BudgetExceeded::Tokens {
                used: 1200,
                limit: 1000
            },
            final_text: String::new(),
        }
    );
    assert_eq!(report.tokens_used, 1200);
}

#[tokio::test(start_paused = true)]
async fn exhausted_model_fails_the_session_and_keeps_the_last_screen() {
    let rig = Rig::new(SMALL);
    let overloaded = || {
        Err(ModelServiceError::Status {
            status: 529,
            message: "Overloaded".into(),
        })
    };
    let scripted = ScriptedModel::new(vec![
        Ok(reply(vec![tool_use("toolu_1", json!({"action": "screenshot"}))])),
        overloaded(),
        overloaded(),
        overloaded(),
    ]);
    let retry = RetryPolicy {
        jitter: false,
        ..RetryPolicy::default()
    };
    let model = Arc::new(Resilient::new(scripted, retry, Duration::from_secs(30)));

    let dir = std::env::temp_dir().join(format!("session-test-{}", Uuid::new_v4().simple()));
    let cfg = AgentConfig {
        screenshot_dir: Some(dir.clone()),
        ..config()
    };
    let (controller, mut rx) = controller(&rig, model, cfg);
    let mut session = Session::new(Uuid::new_v4(), rig.profile, "open Mail");

    let report = controller.run(&mut session, &CancellationToken::new()).await;

    match &report.outcome {
        SessionOutcome::Failed { error } => assert!(error.contains("after 3 attempts"), "{error}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(session.state(), LoopState::Failed);
    let path = report.screenshot.clone().expect("last screen saved");
    assert!(path.starts_with(&dir));
    assert!(tokio::fs::metadata(&path).await.is_ok());
    assert!(matches!(
        drain(&mut rx).last(),
        Some(EventKind::Failed { screenshot: Some(_), .. })
    ));
    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test(start_paused = true)]
async fn unknown_tool_is_reported_back_to_the_model() {
    let rig = Rig::new(SMALL);
    let model = Arc::new(ScriptedModel::new(vec![Ok(reply(vec![
        mac_computer_control::ContentBlock::ToolUse {
            id: "toolu_x".into(),
            name: "bash".into(),
            input: json!({"command": "ls"}),
        },
    ]))]));
    let (controller, _rx) = controller(&rig, model, config());
    let mut session = Session::new(Uuid::new_v4(), rig.profile, "list files");

    let report = controller.run(&mut session, &CancellationToken::new()).await;

    assert!(matches!(report.outcome, SessionOutcome::Completed { .. }));
    assert!(rig.driver.batches().is_empty());
    match &session.history()[2] {
        Message::ToolResult {
            tool_use_id,
            result,
        } => {
            assert_eq!(tool_use_id, "toolu_x");
            assert!(result.error.as_deref().unwrap_or_default().contains("unknown tool"));
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn agent_streams_events_for_a_session() {
    let rig = Rig::new(SMALL);
    let model = Arc::new(ScriptedModel::new(vec![
        Ok(reply(vec![
            text("Taking a look"),
            tool_use("toolu_1", json!({"action": "screenshot"})),
        ])),
        Ok(reply(vec![text("Desktop is empty")])),
    ]));
    let agent = Agent::new(config(), model, rig.dispatcher.clone());
    let mut events = agent.subscribe();

    let handle = agent.start_session("what is on screen?").await.unwrap();
    let id = handle.id();
    let report = handle.join().await.unwrap();
    assert_eq!(report.id, id);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.session_id, id);
        kinds.push(event.kind.name());
    }
    assert_eq!(
        kinds,
        vec![
            "turn_started",
            "model_text",
            "action_dispatched",
            "action_result",
            "turn_started",
            "model_text",
            "done",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn direct_actions_share_the_dispatcher() {
    let rig = Rig::new(SMALL);
    let agent = Agent::new(
        config(),
        Arc::new(ScriptedModel::new(Vec::new())),
        rig.dispatcher.clone(),
    );

    let result = agent
        .execute_direct(&json!({"action": "mouse_move", "coordinate": [3, 4]}))
        .await
        .unwrap();

    assert!(!result.is_error());
    assert!(result.image.is_some());
    assert_eq!(rig.driver.batches().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn per_session_config_overrides_the_agent_defaults() {
    let rig = Rig::new(SMALL);
    let model = Arc::new(LoopingModel::new(json!({"action": "wait", "duration": 0}), 0));
    let agent = Agent::new(config(), model.clone(), rig.dispatcher.clone());

    let narrow = AgentConfig {
        max_turns: 1,
        ..config()
    };
    let report = agent
        .start_session_with("keep waiting", narrow)
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        SessionOutcome::BudgetExhausted {
            reason: BudgetExceeded::Turns { limit: 1 },
            final_text: String::new(),
        }
    );
    assert_eq!(model.calls(), 1);
    assert_eq!(agent.config().max_turns, 50);
}
