// FILE: src/transport/mcp_common.rs
//! Shared argument types and the `stata_run_file` / `stata_run_selection`
//! dispatch logic used by both MCP server instances (§6 "Tools exposed").
//! Grounded on the teacher's per-tool params/result structs in
//! `mcp/schemas.rs`, generalised from filesystem/terminal tools to the two
//! execution tools this spec exposes.

use crate::fanout::ChunkSink;
use crate::model::{Command, RequestContext, TransportKind};
use crate::session_manager::SessionManager;
use crate::transport::{resolve_deadline_seconds, AppState};
use rust_mcp_schema::schema_utils::CallToolError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct StataRunFileParams {
    pub file_path: String,
    pub timeout: Option<f64>,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StataRunSelectionParams {
    pub selection: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ToolCallOutcome {
    pub text: String,
    pub is_error: bool,
}

pub fn run_file_tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "file_path": { "type": "string", "description": "Absolute path to the script to execute." },
            "timeout": { "type": "number", "description": "Deadline in seconds; defaults to command_timeout." },
            "session_id": { "type": "string", "description": "Target session id; defaults to the default session." }
        },
        "required": ["file_path"]
    })
}

pub fn run_selection_tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "selection": { "type": "string", "description": "Code to execute." },
            "session_id": { "type": "string", "description": "Target session id; defaults to the default session." }
        },
        "required": ["selection"]
    })
}

/// Executes `stata_run_file`/`stata_run_selection` against the shared
/// session manager and controller, producing the diagnostic text +
/// `is_error` flag the MCP `tools/call` response needs (§7: "MCP returns a
/// `tools/call` result whose content is the diagnostic text and whose
/// `isError` flag is true for engine-level errors").
pub async fn run_stata_command(
    state: &AppState,
    command: Command,
    session_id: Option<&str>,
    transport: TransportKind,
    progress_token: Option<String>,
    sink: Arc<dyn ChunkSink>,
) -> Result<ToolCallOutcome, CallToolError> {
    let wait_if_busy = SessionManager::is_default_target(session_id);
    let lease = state
        .session_manager
        .acquire(session_id, wait_if_busy)
        .await
        .map_err(CallToolError::from)?;

    let ctx = RequestContext {
        transport,
        request_id: Uuid::new_v4().to_string(),
        progress_token,
        sink,
        // AI clients do not render inline images (§4.6); MCP-originated
        // runs never capture graph artefacts.
        capture_graphs: false,
    };

    let result = state.controller.run(lease, command, ctx).await;
    let spill_dir = std::env::temp_dir().join("stata-mcp-spill");
    let outcome = crate::filter::filter(
        &result.output_text,
        state.config.result_display_mode,
        state.config.max_output_tokens,
        &spill_dir,
        &result.command_id,
    )
    .await;

    let is_error = matches!(
        result.status,
        crate::model::CommandStatus::Error | crate::model::CommandStatus::Timeout
    );
    let text = match &result.error_message {
        Some(msg) if is_error => format!("{}\n{}", outcome.text, msg),
        _ => outcome.text,
    };
    Ok(ToolCallOutcome { text, is_error })
}

pub fn run_file_command(params: StataRunFileParams, state: &AppState) -> Command {
    let deadline = resolve_deadline_seconds(&state.config, params.timeout);
    Command::new_run_file(params.file_path.into(), deadline, true, false)
}

pub fn run_selection_command(params: StataRunSelectionParams, state: &AppState) -> Command {
    let deadline = resolve_deadline_seconds(&state.config, None);
    Command::new_run_code(params.selection, deadline, true, false)
}
