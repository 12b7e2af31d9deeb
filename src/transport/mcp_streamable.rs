// FILE: src/transport/mcp_streamable.rs
//! The streamable-HTTP MCP server instance mounted at `/mcp-streamable`
//! (§4.4, §6). A second, wholly separate server from `mcp_legacy`: it
//! shares only `Arc<SessionManager>`/`Arc<ExecutionController>`, never a
//! request-context resolver, so a notification from one mount can never
//! reach the other connection (§4.4 REDESIGN FLAGS — "the session-mismatch
//! bug remedied by construction"). `rust_mcp_sdk`'s bundled transports only
//! cover stdio and legacy SSE (as the teacher's `main.rs` shows); this mount
//! is hand-rolled directly over `axum`, which both the teacher and this
//! crate already depend on, framing one JSON-RPC message per line
//! (newline-delimited JSON) on a single chunked HTTP response so that
//! `notifications/message` / `notifications/progress` frames and the
//! final `tools/call` result share one connection, per §8's streaming
//! fan-out test.

use crate::fanout::{send_with_backpressure, ChunkSink};
use crate::model::{CommandResult, StreamChunk, TransportKind};
use crate::transport::mcp_common::{
    run_file_command, run_file_tool_schema, run_selection_command, run_selection_tool_schema,
    run_stata_command, StataRunFileParams, StataRunSelectionParams,
};
use crate::transport::AppState;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use rust_mcp_schema::{
    Implementation, InitializeResult, ServerCapabilities, ServerCapabilitiesTools, Tool,
    LATEST_PROTOCOL_VERSION,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

/// Delivers stream chunks as `notifications/message` lines, and, when the
/// call carried a `progress_token`, an additional `notifications/progress`
/// line with `progress = elapsed_seconds`, `total = deadline_seconds`
/// (§4.4 "Progress semantics for MCP").
struct StreamableSink {
    tx: mpsc::Sender<Value>,
    progress_token: Option<Value>,
    deadline_seconds: f64,
    sequence: AtomicU64,
}

#[async_trait]
impl ChunkSink for StreamableSink {
    async fn send_chunk(&self, chunk: StreamChunk) {
        let message = json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": {
                "level": "notice",
                "data": {
                    "command_id": chunk.command_id,
                    "kind": chunk.kind,
                    "text": chunk.payload_text,
                }
            }
        });
        let tx = self.tx.clone();
        send_with_backpressure(message, |m| async move {
            let _ = tx.send(m).await;
        })
        .await;

        if let Some(token) = &self.progress_token {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
            let progress = json!({
                "jsonrpc": "2.0",
                "method": "notifications/progress",
                "params": {
                    "progressToken": token,
                    "progress": chunk.elapsed_seconds,
                    "total": self.deadline_seconds,
                    "sequence": seq,
                }
            });
            let tx = self.tx.clone();
            send_with_backpressure(progress, |m| async move {
                let _ = tx.send(m).await;
            })
            .await;
        }
    }

    async fn send_result(&self, _result: &CommandResult) {
        // The terminal result is framed by the caller as the final
        // `tools/call` JSON-RPC response line, not here.
    }
}

fn server_details_value(request_id: &Value) -> Value {
    let details = InitializeResult {
        server_info: Implementation {
            name: "stata-mcp-server-streamable".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools { list_changed: None }),
            logging: Some(Default::default()),
            ..Default::default()
        },
        meta: None,
        instructions: Some(
            "Executes statistical scripts and code selections in a managed session pool."
                .to_string(),
        ),
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    };
    json!({ "jsonrpc": "2.0", "id": request_id, "result": details })
}

fn tools_list_value(request_id: &Value) -> Value {
    let tools = vec![
        Tool::new("stata_run_file", "Execute a script file in a session.", Some(run_file_tool_schema())),
        Tool::new("stata_run_selection", "Execute a code selection in a session.", Some(run_selection_tool_schema())),
    ];
    json!({ "jsonrpc": "2.0", "id": request_id, "result": { "tools": tools } })
}

fn error_value(request_id: &Value, code: i64, message: String) -> Value {
    json!({ "jsonrpc": "2.0", "id": request_id, "error": { "code": code, "message": message } })
}

fn ndjson_line(value: &Value) -> String {
    format!("{}\n", value)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/mcp-streamable", post(handle_rpc))
        .with_state(Arc::new(state))
}

async fn handle_rpc(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    let request_id = body.get("id").cloned().unwrap_or(Value::Null);
    let method = body.get("method").and_then(Value::as_str).unwrap_or_default().to_string();

    match method.as_str() {
        "initialize" => Json(server_details_value(&request_id)).into_response(),
        "tools/list" => Json(tools_list_value(&request_id)).into_response(),
        "logging/setLevel" => {
            // Per-connection level negotiation has no observable effect on
            // a stateless per-request mount; acknowledged for protocol
            // completeness (§4.4 "clients may lower or raise this through
            // the MCP `logging/setLevel` request, honoured per-connection").
            Json(json!({ "jsonrpc": "2.0", "id": request_id, "result": {} })).into_response()
        }
        "tools/call" => handle_tools_call(state, request_id, body).await,
        other => {
            warn!(method = other, "unknown streamable MCP method");
            Json(error_value(&request_id, -32601, format!("method not found: {}", other))).into_response()
        }
    }
}

async fn handle_tools_call(state: Arc<AppState>, request_id: Value, body: Value) -> Response {
    let params = body.get("params").cloned().unwrap_or_else(|| json!({}));
    let tool_name = params.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    let progress_token = params.get("_meta").and_then(|m| m.get("progressToken")).cloned();
    let progress_token_str = progress_token.as_ref().map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });

    let (command, session_id) = match tool_name.as_str() {
        "stata_run_file" => match serde_json::from_value::<StataRunFileParams>(args) {
            Ok(p) => {
                let sid = p.session_id.clone();
                (run_file_command(p, &state), sid)
            }
            Err(e) => {
                return Json(error_value(&request_id, -32602, e.to_string())).into_response();
            }
        },
        "stata_run_selection" => match serde_json::from_value::<StataRunSelectionParams>(args) {
            Ok(p) => {
                let sid = p.session_id.clone();
                (run_selection_command(p, &state), sid)
            }
            Err(e) => {
                return Json(error_value(&request_id, -32602, e.to_string())).into_response();
            }
        },
        other => {
            return Json(error_value(&request_id, -32601, format!("unknown tool: {}", other))).into_response();
        }
    };

    let deadline_seconds = command.deadline_seconds;
    let (tx, rx) = mpsc::channel::<Value>(64);
    info!(tool = %tool_name, request_id = %Uuid::new_v4(), "dispatching streamable tools/call");

    tokio::spawn(async move {
        let sink: Arc<dyn ChunkSink> = Arc::new(StreamableSink {
            tx: tx.clone(),
            progress_token,
            deadline_seconds,
            sequence: AtomicU64::new(0),
        });

        let outcome = run_stata_command(
            &state,
            command,
            session_id.as_deref(),
            TransportKind::McpStreamable,
            progress_token_str,
            sink,
        )
        .await;

        let final_value = match outcome {
            Ok(outcome) => json!({
                "jsonrpc": "2.0",
                "id": request_id,
                "result": {
                    "content": [{ "type": "text", "text": outcome.text }],
                    "isError": outcome.is_error,
                }
            }),
            Err(e) => error_value(&request_id, -32000, format!("{:?}", e)),
        };
        let _ = tx.send(final_value).await;
    });

    let body_stream = ReceiverStream::new(rx).map(|v| Ok::<_, std::io::Error>(ndjson_line(&v)));
    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
