// FILE: src/main.rs
//! Binary entry point. Dispatches to the worker main loop when re-exec'd
//! with `--worker` (§3, §4.2), otherwise starts the server process: the
//! Session Manager, its idle reaper, and the three always-on transport
//! surfaces (REST/SSE, legacy MCP/SSE, streamable MCP), joined with
//! `tokio::try_join!` exactly as the teacher's `main.rs` starts whichever
//! single transport its `TransportMode` selects — generalised here to all
//! three running concurrently (§4.4).

use anyhow::{Context, Result};
use stata_mcp_core::config::Config;
use stata_mcp_core::controller::ExecutionController;
use stata_mcp_core::session_manager::SessionManager;
use stata_mcp_core::transport::{mcp_legacy, mcp_streamable, rest, AppState};
use stata_mcp_core::worker;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stata_mcp_core={},stata_mcp_server={}", level, level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");
}

/// Worker-side CLI: `--worker --session-id <id> --engine-edition <ed>
/// --stream-interval-secs <n> --log-dir <path> [--log-file <path>]`,
/// matching exactly the arguments `WorkerHandle::spawn` passes.
fn parse_worker_args(raw: &[String]) -> Result<worker::process::WorkerArgs> {
    let mut session_id = None;
    let mut engine_edition = "default".to_string();
    let mut log_file = None;
    let mut log_dir = None;
    let mut stream_interval = Duration::from_secs(6);

    let mut i = 0;
    while i < raw.len() {
        match raw[i].as_str() {
            "--session-id" => {
                session_id = raw.get(i + 1).cloned();
                i += 2;
            }
            "--engine-edition" => {
                engine_edition = raw.get(i + 1).cloned().unwrap_or(engine_edition);
                i += 2;
            }
            "--stream-interval-secs" => {
                if let Some(v) = raw.get(i + 1) {
                    stream_interval = Duration::from_secs(v.parse().unwrap_or(6));
                }
                i += 2;
            }
            "--log-dir" => {
                log_dir = raw.get(i + 1).map(PathBuf::from);
                i += 2;
            }
            "--log-file" => {
                log_file = raw.get(i + 1).map(PathBuf::from);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    Ok(worker::process::WorkerArgs {
        session_id: session_id.context("--worker requires --session-id")?,
        engine_edition,
        log_file,
        log_dir: log_dir.context("--worker requires --log-dir")?,
        stream_interval,
    })
}

/// Best-effort eviction of whatever is already listening on `host:port`
/// when `force_port` is set (§6 configuration table). There is no portable
/// API for "find the process owning this socket"; on Unix hosts this shells
/// out to `fuser`, which is already a reasonable presence-or-absence tool
/// chain assumption for a service binary. Failure here is never fatal — the
/// subsequent `TcpListener::bind` simply fails with its own clear error if
/// eviction did not work.
async fn evict_existing_listener(host: &str, port: u16) {
    if tokio::net::TcpStream::connect((host, port)).await.is_err() {
        return;
    }
    tracing::warn!(host, port, "force_port: evicting existing listener");
    if cfg!(unix) {
        let _ = tokio::process::Command::new("fuser")
            .arg("-k")
            .arg(format!("{}/tcp", port))
            .output()
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--worker") {
        // The worker process gets its own log stream: stdout is reserved
        // for the wire protocol, so logging still goes to stderr.
        setup_logging(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()));
        let worker_args = parse_worker_args(&args[1..])?;
        return worker::process::run(worker_args).await;
    }

    let config = Config::load().context("failed to load configuration")?;
    setup_logging(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()));

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "starting stata-mcp-server");
    tracing::debug!(?config, "loaded configuration");

    stata_mcp_core::filter::clear_spill_dir(&std::env::temp_dir().join("stata-mcp-spill")).await;

    let config = std::sync::Arc::new(config);
    let session_manager = SessionManager::new(config.clone()).await?;
    session_manager.spawn_reaper();

    let controller = std::sync::Arc::new(ExecutionController::new(session_manager.clone(), config.clone()));
    let state = AppState {
        session_manager: session_manager.clone(),
        controller,
        config: config.clone(),
    };

    // Three independent binding ports derived from the single configured
    // `PORT` (§6 only names one `PORT` variable): REST/SSE on `port`,
    // legacy MCP/SSE on `port + 1`, streamable MCP on `port + 2`. Each
    // surface is its own listener, consistent with §4.4's requirement that
    // the two MCP mounts be wholly separate server instances.
    let rest_port = config.port;
    let legacy_mcp_port = config.port + 1;
    let streamable_mcp_port = config.port + 2;

    if config.force_port {
        for port in [rest_port, legacy_mcp_port, streamable_mcp_port] {
            evict_existing_listener(&config.host, port).await;
        }
    }

    let rest_router = rest::router(state.clone());
    let rest_addr = format!("{}:{}", config.host, rest_port);
    let rest_task = async move {
        let listener = tokio::net::TcpListener::bind(&rest_addr)
            .await
            .with_context(|| format!("failed to bind REST/SSE listener on {}", rest_addr))?;
        tracing::info!(addr = %rest_addr, "REST/SSE surface listening");
        axum::serve(listener, rest_router).await.context("REST/SSE server failed")
    };

    let streamable_router = mcp_streamable::router(state.clone());
    let streamable_addr = format!("{}:{}", config.host, streamable_mcp_port);
    let streamable_task = async move {
        let listener = tokio::net::TcpListener::bind(&streamable_addr)
            .await
            .with_context(|| format!("failed to bind streamable MCP listener on {}", streamable_addr))?;
        tracing::info!(addr = %streamable_addr, "streamable MCP surface listening");
        axum::serve(listener, streamable_router)
            .await
            .context("streamable MCP server failed")
    };

    let legacy_host = config.host.clone();
    let legacy_task = async move { mcp_legacy::serve(state, legacy_host, legacy_mcp_port).await };

    tokio::try_join!(rest_task, streamable_task, legacy_task)?;

    tracing::info!("server shutdown");
    Ok(())
}
