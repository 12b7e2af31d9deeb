// FILE: src/transport/mcp_legacy.rs
//! The legacy MCP SSE server instance mounted at `/mcp` (§4.4, §6). Built
//! on `rust_mcp_sdk`'s `ServerHandler` + `hyper_server` exactly as the
//! teacher's `main.rs` constructs its SSE transport, but driving the two
//! execution tools instead of the filesystem/terminal/process tool set.
//! This is a distinct server instance from the streamable endpoint
//! (`mcp_streamable`) so that a notification emitted for a request
//! received here can never reach a connection on the other mount (§4.4
//! REDESIGN FLAGS).

use crate::fanout::ChunkSink;
use crate::model::{CommandResult, StreamChunk, TransportKind};
use crate::transport::mcp_common::{
    run_file_command, run_file_tool_schema, run_selection_command, run_selection_tool_schema,
    run_stata_command, StataRunFileParams, StataRunSelectionParams,
};
use crate::transport::AppState;
use async_trait::async_trait;
use rust_mcp_schema::{
    schema_utils::CallToolError, CallToolRequest, CallToolResult, Implementation, InitializeResult,
    ListToolsRequest, ListToolsResult, ServerCapabilities, ServerCapabilitiesTools, Tool,
    LATEST_PROTOCOL_VERSION,
};
use rust_mcp_sdk::error::McpSdkError;
use rust_mcp_sdk::mcp_server::hyper_server::{create_server, HyperServer, HyperServerOptions};
use rust_mcp_sdk::mcp_server::{ServerHandler, ServerRuntimeContext};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

/// Chunks/results are delivered as `notifications/message` frames tagged
/// with their originating command id; the legacy endpoint has no progress
/// token plumbing of its own, so numeric progress is omitted here and
/// only textual notifications flow (§4.4: "if absent, numeric progress is
/// omitted but textual notifications still flow").
struct McpLegacySink {
    runtime: ServerRuntimeContext,
}

#[async_trait]
impl ChunkSink for McpLegacySink {
    async fn send_chunk(&self, chunk: StreamChunk) {
        let params = json!({
            "level": "notice",
            "data": {
                "command_id": chunk.command_id,
                "kind": chunk.kind,
                "elapsed_seconds": chunk.elapsed_seconds,
                "text": chunk.payload_text,
            }
        });
        if let Err(e) = self.runtime.send_notification("notifications/message", Some(params)).await {
            tracing::debug!(error = ?e, "failed to deliver stream chunk notification");
        }
    }

    async fn send_result(&self, _result: &CommandResult) {
        // The terminal result is returned as the `tools/call` response
        // value itself, not as a notification (§7).
    }
}

fn server_details() -> InitializeResult {
    InitializeResult {
        server_info: Implementation {
            name: "stata-mcp-server-legacy-sse".to_string(),
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
    }
}

struct LegacyHandler {
    state: AppState,
}

#[async_trait]
impl ServerHandler for LegacyHandler {
    async fn handle_list_tools_request(
        &self,
        _request: ListToolsRequest,
        _runtime: &ServerRuntimeContext,
    ) -> Result<ListToolsResult, rust_mcp_schema::RpcError> {
        Ok(ListToolsResult {
            tools: vec![
                Tool::new("stata_run_file", "Execute a script file in a session.", Some(run_file_tool_schema())),
                Tool::new("stata_run_selection", "Execute a code selection in a session.", Some(run_selection_tool_schema())),
            ],
            meta: None,
            next_cursor: None,
        })
    }

    async fn handle_call_tool_request(
        &self,
        request: CallToolRequest,
        runtime: &ServerRuntimeContext,
    ) -> Result<CallToolResult, CallToolError> {
        let args = request.params.arguments.clone().unwrap_or_else(|| json!({}));
        let sink: Arc<dyn ChunkSink> = Arc::new(McpLegacySink { runtime: runtime.clone() });

        let outcome = match request.params.name.as_str() {
            "stata_run_file" => {
                let params: StataRunFileParams = serde_json::from_value(args)
                    .map_err(|e| CallToolError::invalid_params(e.to_string()))?;
                let session_id = params.session_id.clone();
                let command = run_file_command(params, &self.state);
                run_stata_command(&self.state, command, session_id.as_deref(), TransportKind::McpSse, None, sink).await?
            }
            "stata_run_selection" => {
                let params: StataRunSelectionParams = serde_json::from_value(args)
                    .map_err(|e| CallToolError::invalid_params(e.to_string()))?;
                let session_id = params.session_id.clone();
                let command = run_selection_command(params, &self.state);
                run_stata_command(&self.state, command, session_id.as_deref(), TransportKind::McpSse, None, sink).await?
            }
            other => {
                error!(tool = other, "unknown tool called on legacy MCP endpoint");
                return Err(CallToolError::unknown_tool(other.to_string()));
            }
        };

        Ok(CallToolResult::text_content(outcome.text, Some(outcome.is_error))?)
    }
}

async fn map_sdk_error(err: McpSdkError) -> anyhow::Error {
    anyhow::anyhow!("MCP SDK error (legacy SSE transport): {:?}", err)
}

/// Serves the legacy SSE MCP transport at `/mcp` until the process exits.
pub async fn serve(state: AppState, host: String, port: u16) -> anyhow::Result<()> {
    info!(host = %host, port, "starting legacy MCP/SSE transport");
    let options = HyperServerOptions {
        host,
        port,
        enable_cors: true,
        ..Default::default()
    };
    let handler = LegacyHandler { state };
    let server: HyperServer<_> = create_server(server_details(), handler, options);
    server.start().await.map_err(map_sdk_error).await
}
