use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use browser_pilot::ControllerEvent;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// What the page receives over `/events`.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UiEvent {
    Progress { text: String, event: ControllerEvent },
    Result { success: bool, text: String },
    Ready,
}

impl UiEvent {
    fn to_sse_event(&self) -> Event {
        let name = match self {
            UiEvent::Progress { .. } => "progress",
            UiEvent::Result { .. } => "result",
            UiEvent::Ready => "ready",
        };
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        Event::default().event(name).data(data)
    }
}

/// Token of the command currently running, if any.
pub type CancelSlot = Arc<Mutex<Option<CancellationToken>>>;

#[derive(Clone)]
struct AppState {
    cmd_tx: mpsc::Sender<String>,
    event_tx: broadcast::Sender<UiEvent>,
    cancel: CancelSlot,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

pub struct Server {
    pub commands: mpsc::Receiver<String>,
    pub events: broadcast::Sender<UiEvent>,
    pub cancel: CancelSlot,
    pub port: u16,
}

/// Binds the first free port from `port` upwards (ten tries) and serves the UI.
pub async fn start_server(port: u16) -> anyhow::Result<Server> {
    let (cmd_tx, commands) = mpsc::channel::<String>(1);
    let (event_tx, _) = broadcast::channel::<UiEvent>(256);
    let cancel: CancelSlot = Arc::new(Mutex::new(None));

    let state = Arc::new(AppState {
        cmd_tx,
        event_tx: event_tx.clone(),
        cancel: cancel.clone(),
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/cancel", post(cancel_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state);

    let mut bound = None;
    for candidate in port..port.saturating_add(10) {
        match tokio::net::TcpListener::bind(("127.0.0.1", candidate)).await {
            Ok(listener) => {
                bound = Some((listener, candidate));
                break;
            }
            Err(e) => debug!(port = candidate, error = %e, "port busy"),
        }
    }
    let (listener, port) = bound.ok_or_else(|| {
        anyhow::anyhow!("could not bind any port in {port}..{}", port.saturating_add(10))
    })?;

    info!("web UI running at http://localhost:{port}");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "web server stopped");
        }
    });

    Ok(Server {
        commands,
        events: event_tx,
        cancel,
        port,
    })
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> StatusCode {
    let command = payload.command.trim().to_string();
    if command.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    debug!(%command, "command received");
    match state.cmd_tx.try_send(command) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::CONFLICT,
    }
}

async fn cancel_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    let token = state
        .cancel
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    match token {
        Some(token) => {
            info!("cancel requested from web UI");
            token.cancel();
            StatusCode::ACCEPTED
        }
        None => StatusCode::NO_CONTENT,
    }
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
        // Lagged receivers skip what they missed.
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Browser Pilot</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0d1117;
    color: #d7dde5;
    font-family: system-ui, -apple-system, sans-serif;
    height: 100vh;
    display: flex;
    flex-direction: column;
  }
  header {
    padding: 18px 28px;
    border-bottom: 1px solid #1f2630;
    display: flex;
    align-items: center;
    gap: 10px;
  }
  header h1 { font-size: 18px; font-weight: 600; }
  #state { width: 8px; height: 8px; border-radius: 50%; background: #3fb950; }
  #state.busy { background: #d29922; }
  main {
    flex: 1;
    display: flex;
    flex-direction: column;
    max-width: 860px;
    width: 100%;
    margin: 0 auto;
    padding: 20px 28px;
    gap: 14px;
    overflow: hidden;
  }
  #feed { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 6px; }
  .line {
    padding: 8px 12px;
    border-radius: 6px;
    border-left: 3px solid #30363d;
    background: #161b22;
    font-size: 14px;
    white-space: pre-wrap;
  }
  .line.you { border-color: #8957e5; }
  .line.step { border-color: #388bfd; font-family: ui-monospace, monospace; font-size: 13px; }
  .line.fail { border-color: #f85149; color: #ffa198; }
  .line.ok { border-color: #3fb950; color: #7ee787; }
  form { display: flex; gap: 8px; }
  #cmd {
    flex: 1;
    background: #161b22;
    border: 1px solid #30363d;
    border-radius: 6px;
    padding: 11px 14px;
    color: #fff;
    font-size: 15px;
  }
  button {
    border: none;
    border-radius: 6px;
    padding: 11px 20px;
    font-size: 14px;
    font-weight: 600;
    color: #fff;
    background: #238636;
    cursor: pointer;
  }
  button#stop { background: #6e7681; }
  button:disabled { opacity: 0.4; cursor: not-allowed; }
</style>
</head>
<body>
  <header><div id="state"></div><h1>Browser Pilot</h1></header>
  <main>
    <div id="feed"></div>
    <form id="form">
      <input id="cmd" autocomplete="off" placeholder="go to example.com, click &quot;Sign In&quot;, plan: ..." autofocus />
      <button id="go" type="submit">Run</button>
      <button id="stop" type="button" disabled>Cancel</button>
    </form>
  </main>
<script>
  const feed = document.getElementById('feed');
  const cmd = document.getElementById('cmd');
  const go = document.getElementById('go');
  const stop = document.getElementById('stop');
  const state = document.getElementById('state');

  function line(cls, text) {
    const div = document.createElement('div');
    div.className = 'line ' + cls;
    div.textContent = text;
    feed.appendChild(div);
    feed.scrollTop = feed.scrollHeight;
  }

  function busy(on) {
    cmd.disabled = on;
    go.disabled = on;
    stop.disabled = !on;
    state.className = on ? 'busy' : '';
    if (!on) cmd.focus();
  }

  document.getElementById('form').addEventListener('submit', async e => {
    e.preventDefault();
    const text = cmd.value.trim();
    if (!text) return;
    cmd.value = '';
    line('you', text);
    busy(true);
    const res = await fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({command: text}),
    });
    if (res.status === 409) { line('fail', 'busy with another command'); busy(false); }
  });

  stop.addEventListener('click', () => fetch('/cancel', {method: 'POST'}));

  const events = new EventSource('/events');
  events.addEventListener('progress', e => {
    const d = JSON.parse(e.data);
    const failed = d.event.event === 'attempt_failed';
    line(failed ? 'fail' : 'step', d.text);
  });
  events.addEventListener('result', e => {
    const d = JSON.parse(e.data);
    line(d.success ? 'ok' : 'fail', d.text);
  });
  events.addEventListener('ready', () => busy(false));

  line('ok', 'Ready.');
</script>
</body>
</html>
"##;
