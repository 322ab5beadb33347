use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use mac_computer_control::{ActionResult, Agent, SessionEvent, SessionOutcome};
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

fn to_sse_event(event: &SessionEvent) -> Option<Event> {
    Event::default()
        .event(event.kind.name())
        .json_data(event)
        .ok()
}

pub struct AppState {
    agent: Agent,
    /// The one session allowed to drive the display.
    active: Mutex<Option<(Uuid, CancellationToken)>>,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

/// Serves the web UI on the first free port from `first_port`.
pub async fn serve(agent: Agent, first_port: u16) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        agent,
        active: Mutex::new(None),
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/cancel", post(cancel_handler))
        .route("/action", post(action_handler))
        .route("/events", get(sse_handler))
        .route(
            "/favicon.ico",
            get(|| async { StatusCode::NO_CONTENT }),
        )
        .with_state(state);

    let last_port = first_port.saturating_add(9);
    let mut bound = None;
    for port in first_port..=last_port {
        if let Ok(listener) = tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            bound = Some((listener, port));
            break;
        }
    }
    let (listener, port) = bound.ok_or_else(|| {
        anyhow::anyhow!(
            "could not bind to any port {}-{}. Kill the old agent first.",
            first_port,
            last_port
        )
    })?;

    info!("[face] web UI running at http://localhost:{}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> Result<&'static str, (StatusCode, String)> {
    info!("[face] POST /command: {}", payload.command);
    let mut active = state.active.lock().await;
    if active.is_some() {
        return Err((
            StatusCode::CONFLICT,
            "a session is already running; cancel it first".into(),
        ));
    }

    let handle = state
        .agent
        .start_session(payload.command)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    let id = handle.id();
    *active = Some((id, handle.cancellation_token()));
    drop(active);

    let state = state.clone();
    tokio::spawn(async move {
        match handle.join().await {
            Ok(report) => {
                if let SessionOutcome::Failed { error } = &report.outcome {
                    warn!("[face] session {} failed: {}", id, error);
                }
            }
            Err(e) => warn!("[face] session {} panicked: {}", id, e),
        }
        let mut active = state.active.lock().await;
        if matches!(*active, Some((running, _)) if running == id) {
            *active = None;
        }
    });
    Ok("ok")
}

async fn cancel_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.active.lock().await.as_ref() {
        Some((id, cancel)) => {
            info!("[face] cancelling session {}", id);
            cancel.cancel();
            StatusCode::ACCEPTED
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn action_handler(
    State(state): State<Arc<AppState>>,
    Json(input): Json<Value>,
) -> Result<Json<ActionResult>, (StatusCode, String)> {
    info!("[face] POST /action: {}", input);
    state
        .agent
        .execute_direct(&input)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.agent.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => to_sse_event(&event).map(Ok::<_, Infallible>),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Mac Computer Control</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: system-ui, -apple-system, sans-serif;
    height: 100vh;
    display: flex;
    flex-direction: column;
  }
  header {
    padding: 24px 32px;
    border-bottom: 1px solid #1a1a2e;
    display: flex;
    align-items: center;
    gap: 12px;
  }
  header h1 { font-size: 20px; font-weight: 600; color: #fff; }
  header .dot {
    width: 8px; height: 8px;
    border-radius: 50%;
    background: #22c55e;
    animation: pulse 2s infinite;
  }
  header .dot.busy { background: #f59e0b; }
  @keyframes pulse { 0%, 100% { opacity: 1; } 50% { opacity: 0.4; } }
  .main {
    flex: 1;
    display: flex;
    flex-direction: column;
    max-width: 800px;
    width: 100%;
    margin: 0 auto;
    padding: 24px 32px;
    gap: 16px;
    overflow: hidden;
  }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 8px; }
  .entry { padding: 10px 14px; border-radius: 8px; font-size: 14px; line-height: 1.5; }
  .entry.user { background: #1a1a2e; border-left: 3px solid #6366f1; }
  .entry.turn { color: #777; font-size: 12px; padding: 2px 14px; }
  .entry.text { background: #111118; border-left: 3px solid #f59e0b; color: #fcd34d; }
  .entry.action {
    background: #111118;
    border-left: 3px solid #3b82f6;
    font-family: 'SF Mono', Menlo, monospace;
    font-size: 13px;
  }
  .entry.error { background: #1a0a0a; border-left: 3px solid #ef4444; color: #fca5a5; }
  .entry.done { background: #0a1a0a; border-left: 3px solid #22c55e; color: #86efac; }
  .input-area { display: flex; gap: 8px; }
  #cmd {
    flex: 1;
    background: #111118;
    border: 1px solid #222;
    border-radius: 8px;
    padding: 12px 16px;
    color: #fff;
    font-size: 16px;
    outline: none;
  }
  #cmd:focus { border-color: #6366f1; }
  #cmd:disabled { opacity: 0.5; }
  button {
    background: #6366f1;
    color: #fff;
    border: none;
    border-radius: 8px;
    padding: 12px 24px;
    font-size: 15px;
    font-weight: 600;
    cursor: pointer;
  }
  button:disabled { background: #333; cursor: not-allowed; }
  button#stop { background: #ef4444; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="status-dot"></div>
    <h1>Mac Computer Control</h1>
  </header>
  <div class="main">
    <div id="log"></div>
    <div class="input-area">
      <input type="text" id="cmd" placeholder="Tell the agent what to do on this Mac..." autofocus />
      <button id="send" onclick="send()">Send</button>
      <button id="stop" onclick="stop()" disabled>Stop</button>
    </div>
  </div>
<script>
  const log = document.getElementById('log');
  const cmd = document.getElementById('cmd');
  const sendBtn = document.getElementById('send');
  const stopBtn = document.getElementById('stop');
  const dot = document.getElementById('status-dot');
  let busy = false;

  const esc = s => String(s).replace(/</g, '&lt;');

  function addEntry(cls, html) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = html;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
  }

  function setBusy(b) {
    busy = b;
    cmd.disabled = b;
    sendBtn.disabled = b;
    stopBtn.disabled = !b;
    dot.className = b ? 'dot busy' : 'dot';
    if (!b) cmd.focus();
  }

  async function send() {
    const text = cmd.value.trim();
    if (!text || busy) return;
    cmd.value = '';
    addEntry('user', '<strong>You:</strong> ' + esc(text));
    setBusy(true);
    const res = await fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({command: text}),
    });
    if (!res.ok) {
      addEntry('error', '<strong>Could not start:</strong> ' + esc(await res.text()));
      setBusy(false);
    }
  }

  async function stop() {
    await fetch('/cancel', { method: 'POST' });
  }

  cmd.addEventListener('keydown', e => { if (e.key === 'Enter') send(); });

  const es = new EventSource('/events');

  es.addEventListener('turn_started', e => {
    addEntry('turn', 'Turn ' + JSON.parse(e.data).turn);
  });

  es.addEventListener('model_text', e => {
    addEntry('text', esc(JSON.parse(e.data).text));
  });

  es.addEventListener('action_dispatched', e => {
    const d = JSON.parse(e.data);
    addEntry('action', esc(JSON.stringify(d.input)));
  });

  es.addEventListener('action_result', e => {
    const d = JSON.parse(e.data);
    if (d.error) addEntry('error', '<strong>Action error:</strong> ' + esc(d.error));
    else if (d.output) addEntry('action', esc(d.output));
  });

  es.addEventListener('done', e => {
    const d = JSON.parse(e.data);
    addEntry('done', '<strong>Done:</strong> ' + esc(d.final_text || '(no summary)'));
    if (d.warning) addEntry('error', '<strong>Stopped early:</strong> ' + esc(d.warning));
    setBusy(false);
  });

  es.addEventListener('failed', e => {
    const d = JSON.parse(e.data);
    let html = '<strong>Session failed:</strong> ' + esc(d.message);
    if (d.screenshot) html += '<br>Last screen: ' + esc(d.screenshot);
    addEntry('error', html);
    setBusy(false);
  });

  es.addEventListener('cancelled', () => {
    addEntry('error', 'Cancelled.');
    setBusy(false);
  });

  addEntry('done', 'Agent ready. Type a command to begin.');
</script>
</body>
</html>
"##;
