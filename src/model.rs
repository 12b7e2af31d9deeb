// FILE: src/model.rs
//! Wire and in-process data types shared by the session manager, worker
//! protocol, execution controller, and streaming fan-out (§3).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub type SessionId = String;
pub type CommandId = String;

pub const DEFAULT_SESSION_ID: &str = "default";

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Ready,
    Busy,
    Stopping,
    Stopped,
    InitFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    RunCode,
    RunFile,
    Break,
    Shutdown,
    Health,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: CommandId,
    pub kind: CommandKind,
    /// Code string for `RunCode`, or file path for `RunFile`. Unused by
    /// `Break`/`Shutdown`/`Health`.
    pub payload: String,
    /// Optional working-directory hint resolved from `working_directory_policy`.
    pub working_directory: Option<PathBuf>,
    pub deadline_seconds: f64,
    pub streaming_enabled: bool,
    /// Mirrors `RequestContext.capture_graphs` (§4.6): only the REST
    /// adapter sets this, so the worker only pays for graph export when
    /// a caller can actually retrieve the artefact.
    pub capture_graphs: bool,
}

impl Command {
    pub fn new_run_code(code: String, deadline_seconds: f64, streaming_enabled: bool, capture_graphs: bool) -> Self {
        Command {
            command_id: uuid::Uuid::new_v4().to_string(),
            kind: CommandKind::RunCode,
            payload: code,
            working_directory: None,
            deadline_seconds,
            streaming_enabled,
            capture_graphs,
        }
    }

    pub fn new_run_file(path: PathBuf, deadline_seconds: f64, streaming_enabled: bool, capture_graphs: bool) -> Self {
        Command {
            command_id: uuid::Uuid::new_v4().to_string(),
            kind: CommandKind::RunFile,
            payload: path.to_string_lossy().into_owned(),
            working_directory: None,
            deadline_seconds,
            streaming_enabled,
            capture_graphs,
        }
    }

    pub fn new_break() -> Self {
        Command {
            command_id: uuid::Uuid::new_v4().to_string(),
            kind: CommandKind::Break,
            payload: String::new(),
            working_directory: None,
            deadline_seconds: 0.0,
            streaming_enabled: false,
            capture_graphs: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Ok,
    Error,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artefact {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: CommandId,
    pub status: CommandStatus,
    pub output_text: String,
    pub error_message: Option<String>,
    pub duration_ms: u128,
    pub artefacts: Vec<Artefact>,
}

impl CommandResult {
    pub fn timeout(command_id: CommandId, partial_output: String, duration_ms: u128) -> Self {
        CommandResult {
            command_id,
            status: CommandStatus::Timeout,
            output_text: partial_output,
            error_message: Some("execution exceeded its deadline".to_string()),
            duration_ms,
            artefacts: vec![],
        }
    }

    pub fn cancelled(command_id: CommandId, partial_output: String, duration_ms: u128) -> Self {
        CommandResult {
            command_id,
            status: CommandStatus::Cancelled,
            output_text: partial_output,
            error_message: Some("execution was cancelled".to_string()),
            duration_ms,
            artefacts: vec![],
        }
    }

    pub fn worker_died(command_id: CommandId, cause: String) -> Self {
        CommandResult {
            command_id,
            status: CommandStatus::Error,
            output_text: String::new(),
            error_message: Some(format!("session terminated: {}", cause)),
            duration_ms: 0,
            artefacts: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChunkKind {
    Heartbeat,
    LogTail,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub command_id: CommandId,
    pub sequence: u64,
    pub kind: StreamChunkKind,
    pub timestamp_ms: i64,
    pub elapsed_seconds: f64,
    pub payload_text: String,
}

impl StreamChunk {
    pub fn heartbeat(command_id: CommandId, sequence: u64, elapsed_seconds: f64) -> Self {
        StreamChunk {
            command_id,
            sequence,
            kind: StreamChunkKind::Heartbeat,
            timestamp_ms: now_millis(),
            elapsed_seconds,
            payload_text: String::new(),
        }
    }

    pub fn info(command_id: CommandId, sequence: u64, elapsed_seconds: f64, text: String) -> Self {
        StreamChunk {
            command_id,
            sequence,
            kind: StreamChunkKind::Info,
            timestamp_ms: now_millis(),
            elapsed_seconds,
            payload_text: text,
        }
    }

    pub fn log_tail(command_id: CommandId, sequence: u64, elapsed_seconds: f64, text: String) -> Self {
        StreamChunk {
            command_id,
            sequence,
            kind: StreamChunkKind::LogTail,
            timestamp_ms: now_millis(),
            elapsed_seconds,
            payload_text: text,
        }
    }
}

/// Wire envelope a worker process writes one-per-line to its stdout: either
/// a terminal result or an in-flight stream chunk, tagged so the parent can
/// demultiplex without ambiguity (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Result(CommandResult),
    Stream(StreamChunk),
    /// Emitted once after engine init completes (successfully or not).
    Ready { ok: bool, error: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    RestSse,
    McpSse,
    McpStreamable,
}

/// Per in-flight transport call. Carries the sink the Streaming Fan-out
/// writes to, and nothing else — there is no global/current-session
/// fallback (§4.4).
#[derive(Clone)]
pub struct RequestContext {
    pub transport: TransportKind,
    pub request_id: String,
    pub progress_token: Option<String>,
    pub sink: std::sync::Arc<dyn crate::fanout::ChunkSink>,
    /// Only the REST/editor transport wants graphs exported to disk (§4.6).
    pub capture_graphs: bool,
}

/// Read-only projection of a Session for `list_sessions` (§4.1), grounded
/// on the teacher's `SessionInfo` shape.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub state: SessionState,
    pub is_default: bool,
    pub created_at_ms: i64,
    pub last_activity_at_ms: i64,
}

/// Monotonic-non-decreasing activity clock, updated without holding the
/// session's execution lease (§3 invariant: `last_activity_at` never goes
/// backwards within a session).
#[derive(Debug)]
pub struct ActivityClock(AtomicI64);

impl ActivityClock {
    pub fn new() -> Self {
        ActivityClock(AtomicI64::new(now_millis()))
    }

    pub fn touch(&self) {
        self.0.store(now_millis(), Ordering::SeqCst);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}
