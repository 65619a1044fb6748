//! Gateway: terminates the JSON RPC surface, the bidirectional PTY
//! WebSocket stream, static asset serving, and the multiplexer hook
//! endpoint. Route shape follows the teacher's `web_server.rs` (one handler
//! per concern, `AppState` threaded via `with_state`), generalized from
//! one-shot session PTYs to attaching to any existing multiplexer pane.

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::service::TowerToHyperService;
use muxtunnel_core::error::{MuxError, OrderError, ResolverError};
use muxtunnel_core::mux::{shows_live_thinking_indicator, MuxAdapter};
use muxtunnel_core::order::OrderStore;
use muxtunnel_core::pty::{self, PtyClientId, PtyRegistry, RunState};
use muxtunnel_core::resolver::Resolver;
use muxtunnel_core::settings::SettingsStore;
use muxtunnel_core::types::Session;
use muxtunnel_core::watcher::AssistantWatcher;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::warn;

/// Pane processes treated as the assistant binary for link enrichment.
const ASSISTANT_BINARY_NAMES: &[&str] = &["claude"];

/// Shared service state: every long-lived component the Gateway calls into.
/// `control_channels` and `pid_index` are the weak lookup tables spec §9
/// calls for — cleared on client death, never shared ownership.
#[derive(Clone)]
pub struct AppState {
    pub mux: Arc<MuxAdapter>,
    pub pty: PtyRegistry,
    pub watcher: AssistantWatcher,
    pub resolver: Arc<Resolver>,
    pub settings: SettingsStore,
    pub order: Arc<OrderStore>,
    pub static_dir: PathBuf,
    control_channels: Arc<DashMap<PtyClientId, mpsc::UnboundedSender<String>>>,
    pid_index: Arc<DashMap<u32, PtyClientId>>,
}

impl AppState {
    pub fn new(
        mux: Arc<MuxAdapter>,
        pty: PtyRegistry,
        watcher: AssistantWatcher,
        resolver: Arc<Resolver>,
        settings: SettingsStore,
        order: Arc<OrderStore>,
        static_dir: PathBuf,
    ) -> Self {
        Self {
            mux,
            pty,
            watcher,
            resolver,
            settings,
            order,
            static_dir,
            control_channels: Arc::new(DashMap::new()),
            pid_index: Arc::new(DashMap::new()),
        }
    }
}

/// Error envelope for RPC handlers: `{error: string}` with an HTTP status
/// chosen from the originating component error (spec §7's taxonomy).
struct GatewayError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<MuxError> for GatewayError {
    fn from(e: MuxError) -> Self {
        let status = match &e {
            MuxError::PaneNotFound(_) | MuxError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            MuxError::InvalidSessionName(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        GatewayError { status, message: e.to_string() }
    }
}

impl From<ResolverError> for GatewayError {
    fn from(e: ResolverError) -> Self {
        let status = match &e {
            ResolverError::NotFound(_) => StatusCode::NOT_FOUND,
            ResolverError::Malformed(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        GatewayError { status, message: e.to_string() }
    }
}

impl From<OrderError> for GatewayError {
    fn from(e: OrderError) -> Self {
        GatewayError { status: StatusCode::INTERNAL_SERVER_ERROR, message: e.to_string() }
    }
}

/// Build the full route table and wrap it with permissive CORS
/// (single-tenant localhost, per spec §6).
pub fn build_router(state: AppState) -> Router {
    let assets_dir = state.static_dir.join("assets");
    Router::new()
        .route("/api/sessions", get(sessions_list_handler))
        .route("/api/sessions/create", post(sessions_create_handler))
        .route("/api/sessions/delete", post(sessions_delete_handler))
        .route("/api/panes/delete", post(panes_delete_handler))
        .route("/api/panes/input", post(panes_input_handler))
        .route("/api/panes/interrupt", post(panes_interrupt_handler))
        .route("/api/projects", get(projects_list_handler))
        .route("/api/projects/resolve", post(projects_resolve_handler))
        .route("/api/claude/mark-viewed", post(claude_mark_viewed_handler))
        .route(
            "/api/session-order",
            get(session_order_get_handler).post(session_order_save_handler),
        )
        .route("/api/settings", get(settings_get_handler))
        .route("/api/settings/background", get(settings_background_handler))
        .route("/api/health", get(health_handler))
        .route("/api/internal/session-changed", get(session_changed_hook_handler))
        .route("/ws", get(ws_handler))
        .nest_service("/assets", ServeDir::new(assets_dir))
        .fallback(get(spa_fallback_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Accept loop built on `hyper_util`'s auto-builder instead of
/// `axum::serve`, so every accepted connection gets `set_nodelay(true)`
/// before being served — `axum::serve` doesn't expose that hook, and PTY
/// streams are latency-sensitive enough that Nagle's algorithm matters.
pub async fn serve(router: Router, host: &str, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    let service = TowerToHyperService::new(router);

    loop {
        let (stream, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to disable Nagle's algorithm on accepted socket");
        }
        let io = TokioIo::new(stream);
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = AutoBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                warn!(error = %err, "connection terminated with an error");
            }
        });
    }
}

async fn spa_fallback_handler(State(state): State<AppState>) -> Response {
    let index_path = state.static_dir.join("index.html");
    match tokio::fs::read_to_string(&index_path).await {
        Ok(content) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(Body::from(content))
            .unwrap(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to load index.html: {e}")).into_response(),
    }
}

/// Enrich each pane whose resolved process matches an assistant binary with
/// its active transcript link (spec §4.4 pane linkage).
async fn enrich_snapshot(state: &AppState, mut snapshot: Vec<Session>) -> Vec<Session> {
    for session in &mut snapshot {
        for window in &mut session.windows {
            for pane in &mut window.panes {
                if !ASSISTANT_BINARY_NAMES.contains(&pane.process.as_str()) {
                    continue;
                }
                let Ok(cwd) = state.mux.pane_cwd(&pane.target).await else {
                    continue;
                };
                state.watcher.scan_project(&cwd);
                let mut link = state.watcher.active_session_for_project(&cwd);
                // A live thinking indicator in the pane's own recent output
                // overrides the transcript-derived status. Only the
                // Gateway's own copy of the link changes here; the
                // watcher's latch stays the sole authority over `notified`.
                if let Some(link) = link.as_mut() {
                    let tail = state.mux.capture_pane_tail(&pane.target).await;
                    if shows_live_thinking_indicator(&tail) {
                        link.status = muxtunnel_core::types::AssistantStatus::Thinking;
                    }
                }
                pane.claude_session = link;
            }
        }
    }
    snapshot
}

async fn sessions_list_handler(State(state): State<AppState>) -> Json<Vec<Session>> {
    let snapshot = state.mux.snapshot().await;
    let snapshot = enrich_snapshot(&state, snapshot).await;

    let names: Vec<String> = snapshot.iter().map(|s| s.name.clone()).collect();
    let ordered_names = state.order.apply(&names);
    let mut by_name: HashMap<String, Session> = snapshot.into_iter().map(|s| (s.name.clone(), s)).collect();
    let ordered: Vec<Session> = ordered_names.into_iter().filter_map(|n| by_name.remove(&n)).collect();
    Json(ordered)
}

#[derive(Deserialize)]
struct CreateSessionBody {
    name: String,
    cwd: String,
}

async fn sessions_create_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<Value>, GatewayError> {
    state.mux.create_session(&body.name, &body.cwd).await?;
    Ok(Json(json!({})))
}

#[derive(Deserialize)]
struct NameBody {
    name: String,
}

async fn sessions_delete_handler(
    State(state): State<AppState>,
    Json(body): Json<NameBody>,
) -> Result<Json<Value>, GatewayError> {
    state.mux.kill_session(&body.name).await?;
    Ok(Json(json!({})))
}

#[derive(Deserialize)]
struct TargetBody {
    target: String,
}

async fn panes_delete_handler(
    State(state): State<AppState>,
    Json(body): Json<TargetBody>,
) -> Result<Json<Value>, GatewayError> {
    state.mux.kill_pane(&body.target).await?;
    Ok(Json(json!({})))
}

#[derive(Deserialize)]
struct PaneInputBody {
    target: String,
    text: String,
}

/// `panes.input`: sends `text` as literal keystrokes, then a separate
/// Enter — `tmux send-keys -l` can't express "Enter" alongside literal text
/// in one call.
async fn panes_input_handler(
    State(state): State<AppState>,
    Json(body): Json<PaneInputBody>,
) -> Result<Json<Value>, GatewayError> {
    state.mux.send_keys(&body.target, &body.text, true).await?;
    state.mux.send_enter(&body.target).await?;
    Ok(Json(json!({})))
}

async fn panes_interrupt_handler(
    State(state): State<AppState>,
    Json(body): Json<TargetBody>,
) -> Result<Json<Value>, GatewayError> {
    state.mux.send_interrupt(&body.target).await?;
    Ok(Json(json!({})))
}

#[derive(Deserialize)]
struct ProjectsQuery {
    #[serde(default)]
    query: String,
}

async fn projects_list_handler(
    State(state): State<AppState>,
    Query(q): Query<ProjectsQuery>,
) -> Result<Json<Value>, GatewayError> {
    let entries = state.resolver.list(&q.query).await?;
    Ok(Json(json!(entries)))
}

async fn projects_resolve_handler(
    State(state): State<AppState>,
    Json(body): Json<NameBody>,
) -> Result<Json<Value>, GatewayError> {
    match state.resolver.resolve_one(&body.name).await? {
        Some(entry) => {
            // Selecting a project via resolve is the point at which it
            // becomes "used"; bump its frecency the same moment a session
            // gets created from it.
            let _ = state.resolver.record_selection(&entry.path);
            Ok(Json(json!(entry)))
        }
        None => Err(GatewayError { status: StatusCode::NOT_FOUND, message: format!("project not found: {}", body.name) }),
    }
}

#[derive(Deserialize)]
struct MarkViewedBody {
    id: String,
}

async fn claude_mark_viewed_handler(
    State(state): State<AppState>,
    Json(body): Json<MarkViewedBody>,
) -> Json<Value> {
    state.watcher.mark_viewed(&body.id);
    Json(json!({}))
}

async fn session_order_get_handler(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.order.get())
}

#[derive(Deserialize)]
struct SessionOrderBody {
    order: Vec<String>,
}

async fn session_order_save_handler(
    State(state): State<AppState>,
    Json(body): Json<SessionOrderBody>,
) -> Result<Json<Value>, GatewayError> {
    state.order.save(body.order)?;
    Ok(Json(json!({})))
}

async fn settings_get_handler(State(state): State<AppState>) -> Json<Value> {
    let (settings, version) = state.settings.get();
    Json(json!({ "version": version, "settings": settings }))
}

async fn settings_background_handler(State(state): State<AppState>) -> Response {
    let (settings, _) = state.settings.get();
    let Some(path) = settings.background.image else {
        return (StatusCode::NOT_FOUND, "no background configured").into_response();
    };
    let path = PathBuf::from(path);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&path).first_raw().unwrap_or("application/octet-stream");
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", mime)
                .body(Body::from(bytes))
                .unwrap()
        }
        Err(e) => (StatusCode::NOT_FOUND, format!("background image unreadable: {e}")).into_response(),
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    #[serde(rename = "tmuxRunning")]
    tmux_running: bool,
}

async fn health_handler() -> Json<HealthBody> {
    Json(HealthBody { status: "ok", tmux_running: pty::tmux_available() })
}

#[derive(Deserialize)]
struct HookQuery {
    pid: u32,
    session: String,
}

/// `GET /api/internal/session-changed?pid&session`, called by the
/// multiplexer hook installed in `install_session_changed_hook`. Looks up
/// the WebSocket whose PtyClient owns `pid` and forwards a control frame.
async fn session_changed_hook_handler(State(state): State<AppState>, Query(q): Query<HookQuery>) -> StatusCode {
    let Some(client_id) = state.pid_index.get(&q.pid).map(|e| *e.value()) else {
        return StatusCode::NOT_FOUND;
    };
    let Some(sender) = state.control_channels.get(&client_id) else {
        return StatusCode::NOT_FOUND;
    };
    let frame = json!({ "type": "session-changed", "session": q.session }).to_string();
    let _ = sender.send(frame);
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct WsQuery {
    pane: String,
    cols: u16,
    rows: u16,
}

async fn ws_handler(State(state): State<AppState>, Query(query): Query<WsQuery>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_pty_socket(socket, state, query))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientControl {
    Resize { cols: u16, rows: u16 },
    Keys { keys: String },
}

/// Drive one attached pane's WebSocket: `pane-info` before the first data
/// byte, binary PTY bytes verbatim, JSON control frames interleaved but
/// never splitting a data chunk, and a 30 s heartbeat (spec §4.3).
async fn handle_pty_socket(mut socket: WebSocket, state: AppState, query: WsQuery) {
    let pane = match state.mux.get_pane_info(&query.pane).await {
        Ok(p) => p,
        Err(_) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame { code: 4001, reason: "Pane not found".into() })))
                .await;
            return;
        }
    };

    let (client, mut live_rx, mut state_rx) = match pty::open(&state.pty, &query.pane, query.cols, query.rows).await {
        Ok(v) => v,
        Err(_) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame { code: 4002, reason: "Failed to attach pty".into() })))
                .await;
            return;
        }
    };

    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<String>();
    state.control_channels.insert(client.id, control_tx);
    if let Some(pid) = client.pid {
        state.pid_index.insert(pid, client.id);
    }

    let info = json!({ "type": "pane-info", "pane": pane }).to_string();
    if socket.send(Message::Text(info.into())).await.is_err() {
        cleanup_client(&state, &client);
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
    heartbeat.tick().await;
    let mut ping_outstanding = false;

    loop {
        tokio::select! {
            chunk = live_rx.recv() => {
                match chunk {
                    Ok(bytes) => {
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
            Some(text) = control_rx.recv() => {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Some(run_state) = state_rx.recv() => {
                if let RunState::Exited { .. } = run_state {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame { code: 1000, reason: "session ended".into() })))
                        .await;
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientControl>(&text) {
                            Ok(ClientControl::Resize { cols, rows }) => client.resize(cols, rows),
                            Ok(ClientControl::Keys { keys }) => { let _ = client.write(keys.as_bytes()); }
                            Err(_) => { let _ = client.write(text.as_bytes()); }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => { let _ = client.write(&data); }
                    Some(Ok(Message::Pong(_))) => { ping_outstanding = false; }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                if ping_outstanding {
                    break;
                }
                ping_outstanding = true;
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    cleanup_client(&state, &client);
}

fn cleanup_client(state: &AppState, client: &pty::PtyClient) {
    state.control_channels.remove(&client.id);
    if let Some(pid) = client.pid {
        state.pid_index.remove(&pid);
    }
    pty::close(&state.pty, client.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_control_parses_resize_and_keys() {
        let resize: ClientControl = serde_json::from_str(r#"{"type":"resize","cols":80,"rows":24}"#).unwrap();
        assert!(matches!(resize, ClientControl::Resize { cols: 80, rows: 24 }));

        let keys: ClientControl = serde_json::from_str(r#"{"type":"keys","keys":"ls\n"}"#).unwrap();
        assert!(matches!(keys, ClientControl::Keys { .. }));
    }

    #[test]
    fn client_control_rejects_unrecognized_text() {
        let parsed = serde_json::from_str::<ClientControl>("not json at all");
        assert!(parsed.is_err());
    }
}
