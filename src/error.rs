// FILE: src/error.rs
use rust_mcp_schema::RpcErrorCode;
use thiserror::Error;

/// Errors surfaced by the hard core (session manager, controller, worker
/// protocol, output filter). Transport adapters translate these into their
/// own wire shape; engine-level failures never escape as process errors —
/// they are captured as text inside a `Result` instead (see `model::Result`).
#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Session not found for ID: {0}")]
    SessionNotFound(String),

    #[error("Session pool is full (max_sessions reached)")]
    PoolFull,

    #[error("Session is busy executing another command")]
    BusyConflict,

    #[error("Command execution timed out after {0:.1}s")]
    Timeout(f64),

    #[error("Command was cancelled")]
    Cancelled,

    #[error("session terminated")]
    WorkerDied(String),

    #[error("Failed to spill output to disk: {0}")]
    SpillFailed(String),

    #[error("Failed to filter output: {0}")]
    FilterFailed(String),

    #[error("Worker protocol error: {0}")]
    ProtocolError(String),

    #[error("Hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("Invalid input argument: {0}")]
    InvalidInputArgument(String),
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err)
    }
}

impl AppError {
    /// SessionNotFound / PoolFull / BusyConflict never reach the engine;
    /// §7 requires these to be surfaced at the transport boundary with a
    /// distinct status rather than folded into an engine-error response.
    pub fn is_boundary_error(&self) -> bool {
        matches!(
            self,
            AppError::SessionNotFound(_) | AppError::PoolFull | AppError::BusyConflict
        )
    }
}

impl From<AppError> for rust_mcp_schema::schema_utils::CallToolError {
    fn from(err: AppError) -> Self {
        tracing::error!(error = %err, "AppError converted to CallToolError");
        let rpc_error = match &err {
            AppError::InvalidInputArgument(_) | AppError::SessionNotFound(_) => {
                rust_mcp_schema::RpcError::new(RpcErrorCode::InvalidParams, err.to_string(), None)
            }
            AppError::BusyConflict | AppError::PoolFull => {
                rust_mcp_schema::RpcError::new(RpcErrorCode::ServerError(-32001), err.to_string(), None)
            }
            _ => rust_mcp_schema::RpcError::new(RpcErrorCode::InternalError, err.to_string(), None),
        };
        rust_mcp_schema::schema_utils::CallToolError::new(rpc_error)
    }
}
