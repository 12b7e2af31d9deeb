// FILE: src/transport/rest.rs
//! REST/SSE transport adapter (§6 "REST/SSE surface"), grounded on the
//! teacher's intended `axum`/`tower-http` stack (declared in its
//! Cargo.toml's `sse` feature) generalised into an always-on router.

use crate::controller::ExecutionController;
use crate::error::AppError;
use crate::fanout::{send_with_backpressure, ChunkSink, NullSink};
use crate::filter;
use crate::model::{Command, CommandResult, RequestContext, SessionState, StreamChunk, TransportKind};
use crate::session_manager::SessionManager;
use crate::transport::{resolve_deadline_seconds, AppState};
use async_trait::async_trait;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/run_file", get(run_file))
        .route("/run_file/stream", get(run_file_stream))
        .route("/run_selection", post(run_selection))
        .route("/stop_execution", post(stop_execution))
        .route("/execution_status", get(execution_status))
        .route("/view_data", get(view_data))
        .route("/graphs/:name", get(get_graph))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(destroy_session))
        .route("/sessions/:id/stop", post(stop_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunFileQuery {
    file_path: String,
    timeout: Option<f64>,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunSelectionQuery {
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Sends stream chunks as SSE `data:` frames, the final result is sent as
/// the terminal `data:` frame of the stream (§6 "concluding with the final
/// output").
struct RestSink {
    tx: mpsc::Sender<Event>,
}

#[async_trait]
impl ChunkSink for RestSink {
    async fn send_chunk(&self, chunk: StreamChunk) {
        let event = Event::default().data(chunk.payload_text.clone()).event("chunk");
        let tx = self.tx.clone();
        send_with_backpressure(event, |e| async move {
            let _ = tx.send(e).await;
        })
        .await;
    }

    async fn send_result(&self, result: &CommandResult) {
        if let Ok(body) = serde_json::to_string(result) {
            let tx = self.tx.clone();
            let event = Event::default().data(body).event("result");
            send_with_backpressure(event, |e| async move {
                let _ = tx.send(e).await;
            })
            .await;
        }
    }
}

/// Maps an `AppError` to `(StatusCode, Json<ErrorBody>)` per §7: boundary
/// errors (SessionNotFound/PoolFull/BusyConflict) get a distinct non-200
/// status, everything else is a protocol-level failure (500).
fn error_response(err: AppError) -> (StatusCode, Json<ErrorBody>) {
    let status = match &err {
        AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        AppError::PoolFull => StatusCode::TOO_MANY_REQUESTS,
        AppError::BusyConflict => StatusCode::CONFLICT,
        AppError::InvalidInputArgument(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody { error: err.to_string() }))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine_available = state
        .session_manager
        .list_sessions()
        .iter()
        .any(|s| s.state == SessionState::Ready || s.state == SessionState::Busy);
    Json(json!({ "status": "ok", "engine_available": engine_available }))
}

/// Runs a command to completion against a non-streaming sink and returns
/// its filtered `output_text`, per §7's "HTTP 200 with diagnostic body for
/// engine-level errors" rule — only boundary/protocol errors get a
/// non-200 status.
async fn run_to_completion(
    state: &AppState,
    command: Command,
    session_id: Option<&str>,
    capture_graphs: bool,
) -> Result<CommandResult, AppError> {
    let wait_if_busy = SessionManager::is_default_target(session_id);
    let lease = state.session_manager.acquire(session_id, wait_if_busy).await?;
    let sink: Arc<dyn ChunkSink> = Arc::new(NullSink);
    let ctx = RequestContext {
        transport: TransportKind::RestSse,
        request_id: Uuid::new_v4().to_string(),
        progress_token: None,
        sink,
        capture_graphs,
    };
    Ok(state.controller.run(lease, command, ctx).await)
}

async fn filtered_text(state: &AppState, result: &CommandResult) -> String {
    let spill_dir = std::env::temp_dir().join("stata-mcp-spill");
    let outcome = filter::filter(
        &result.output_text,
        state.config.result_display_mode,
        state.config.max_output_tokens,
        &spill_dir,
        &result.command_id,
    )
    .await;
    if let Some(warning) = outcome.warning {
        format!("{}\n[warning: {}]", outcome.text, warning)
    } else {
        outcome.text
    }
}

async fn run_file(State(state): State<Arc<AppState>>, Query(q): Query<RunFileQuery>) -> impl IntoResponse {
    let deadline = resolve_deadline_seconds(&state.config, q.timeout);
    let command = Command::new_run_file(q.file_path.clone().into(), deadline, false, true);
    match run_to_completion(&state, command, q.session_id.as_deref(), true).await {
        Ok(result) => filtered_text(&state, &result).await.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn run_selection(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RunSelectionQuery>,
    body: String,
) -> impl IntoResponse {
    let deadline = resolve_deadline_seconds(&state.config, None);
    let command = Command::new_run_code(body, deadline, false, true);
    match run_to_completion(&state, command, q.session_id.as_deref(), true).await {
        Ok(result) => filtered_text(&state, &result).await.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn run_file_stream(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RunFileQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Event>(64);
    let deadline = resolve_deadline_seconds(&state.config, q.timeout);
    let session_id = q.session_id.clone();
    let file_path = q.file_path.clone();
    let state = state.clone();

    tokio::spawn(async move {
        let command = Command::new_run_file(file_path.into(), deadline, true, true);
        let wait_if_busy = SessionManager::is_default_target(session_id.as_deref());
        let lease = match state.session_manager.acquire(session_id.as_deref(), wait_if_busy).await {
            Ok(l) => l,
            Err(e) => {
                let _ = tx
                    .send(Event::default().event("error").data(e.to_string()))
                    .await;
                return;
            }
        };
        let sink: Arc<dyn ChunkSink> = Arc::new(RestSink { tx: tx.clone() });
        let ctx = RequestContext {
            transport: TransportKind::RestSse,
            request_id: Uuid::new_v4().to_string(),
            progress_token: None,
            sink,
            capture_graphs: true,
        };
        let result = state.controller.run(lease, command, ctx).await;
        let text = filtered_text(&state, &result).await;
        let _ = tx.send(Event::default().event("final").data(text)).await;
    });

    Sse::new(ReceiverStream::new(rx).map(Ok)).keep_alive(KeepAlive::default())
}

async fn stop_execution(State(state): State<Arc<AppState>>, Query(q): Query<SessionQuery>) -> impl IntoResponse {
    match state.controller.break_session(q.session_id.as_deref()).await {
        Ok(had_in_flight) => Json(json!({ "broke_in_flight_command": had_in_flight })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn execution_status(State(state): State<Arc<AppState>>, Query(q): Query<SessionQuery>) -> impl IntoResponse {
    let id = q.session_id.as_deref().unwrap_or(crate::model::DEFAULT_SESSION_ID);
    match state.session_manager.list_sessions().into_iter().find(|s| s.session_id == id) {
        Some(view) => {
            let elapsed = (chrono::Utc::now().timestamp_millis() - view.last_activity_at_ms) as f64 / 1000.0;
            Json(json!({ "state": view.state, "elapsed_seconds": elapsed })).into_response()
        }
        None => error_response(AppError::SessionNotFound(id.to_string())).into_response(),
    }
}

/// The embedded engine's dataset model is out of scope (§1 Non-goals name
/// "the identity of the statistical engine itself"); this returns the
/// shape the editor expects with an empty payload rather than omitting
/// the route.
async fn view_data(State(state): State<Arc<AppState>>, Query(q): Query<SessionQuery>) -> impl IntoResponse {
    let id = q.session_id.as_deref();
    let wait_if_busy = SessionManager::is_default_target(id);
    match state.session_manager.acquire(id, wait_if_busy).await {
        Ok(lease) => {
            state.session_manager.release(lease);
            Json(json!({ "columns": [], "rows": 0, "index": [], "dtypes": {}, "data": [] })).into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

async fn get_graph(State(state): State<Arc<AppState>>, AxumPath(name): AxumPath<String>, Query(q): Query<SessionQuery>) -> impl IntoResponse {
    let session_id = q.session_id.unwrap_or_else(|| crate::model::DEFAULT_SESSION_ID.to_string());
    let session_graphs_dir = state.config.log_directory().join("graphs").join(&session_id);
    let mut newest: Option<(std::time::SystemTime, std::path::PathBuf)> = None;
    if let Ok(mut entries) = tokio::fs::read_dir(&session_graphs_dir).await {
        while let Ok(Some(command_dir)) = entries.next_entry().await {
            let candidate = command_dir.path().join(format!("{}.png", name));
            if let Ok(meta) = tokio::fs::metadata(&candidate).await {
                if let Ok(modified) = meta.modified() {
                    if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                        newest = Some((modified, candidate));
                    }
                }
            }
        }
    }
    match newest {
        Some((_, path)) => match tokio::fs::read(&path).await {
            Ok(bytes) => ([("content-type", "image/png")], bytes).into_response(),
            Err(e) => error_response(AppError::Io(e)).into_response(),
        },
        None => error_response(AppError::InvalidInputArgument(format!("no such graph: {}", name))).into_response(),
    }
}

async fn create_session(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.session_manager.create_session().await {
        Ok(id) => (StatusCode::CREATED, Json(json!({ "session_id": id }))).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.session_manager.list_sessions())
}

async fn get_session(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> impl IntoResponse {
    match state.session_manager.list_sessions().into_iter().find(|s| s.session_id == id) {
        Some(view) => Json(view).into_response(),
        None => error_response(AppError::SessionNotFound(id)).into_response(),
    }
}

async fn destroy_session(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> impl IntoResponse {
    match state.session_manager.destroy_session(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn stop_session(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> impl IntoResponse {
    match state.controller.break_session(Some(&id)).await {
        Ok(had_in_flight) => Json(json!({ "broke_in_flight_command": had_in_flight })).into_response(),
        Err(e) => {
            warn!(session_id = %id, error = %e, "stop_session failed");
            error_response(e).into_response()
        }
    }
}
