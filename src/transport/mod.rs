// FILE: src/transport/mod.rs
//! Transport Adapters (§2 glossary): thin shells translating wire requests
//! into `ExecutionController` calls and results back into each transport's
//! native wire shape. Grounded on the teacher's `main.rs`, which builds one
//! transport at a time behind a feature flag; here all three surfaces are
//! always on and share one `Arc<AppState>`.

pub mod mcp_common;
pub mod mcp_legacy;
pub mod mcp_streamable;
pub mod rest;

use crate::controller::ExecutionController;
use crate::session_manager::SessionManager;
use std::sync::Arc;

/// Shared state every transport adapter is constructed with. Mirrors the
/// teacher's `AppManagers` shape (one struct of `Arc<...>` managers handed
/// to every handler) but holding the session manager and controller
/// instead of filesystem/terminal/process managers.
#[derive(Clone)]
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
    pub controller: Arc<ExecutionController>,
    pub config: Arc<crate::config::Config>,
}

/// Resolves the deadline to use for a command: the caller's explicit
/// timeout if given, else `config.command_timeout` (§6 "Default deadline
/// if a caller omits one").
pub fn resolve_deadline_seconds(config: &crate::config::Config, requested: Option<f64>) -> f64 {
    requested.unwrap_or_else(|| config.command_timeout.as_secs_f64())
}
