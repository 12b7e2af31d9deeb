// FILE: src/worker/process.rs
//! The worker-side main loop: this runs inside the spawned child process
//! (never inside the main server process — the engine is confined to
//! workers, §9). Reads `Command` frames from stdin, drives one
//! `StatEngine`, and writes `WorkerMessage` frames to stdout.

use crate::artefacts;
use crate::engine::{NullEngine, StatEngine, CLEAR_SCREEN_TOKEN};
use crate::model::{Command, CommandKind, CommandResult, CommandStatus, StreamChunk, WorkerMessage};
use crate::worker::capture::CaptureBuffer;
use crate::worker::protocol;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Performs a minimal warm-up render to force a host's graphics subsystem
/// to initialise on the worker's main thread before any command is
/// accepted (§4.2, §9). Only macOS-hosted managed runtimes are known to
/// crash without this; every other platform is a no-op.
pub fn warm_up_graphics() {
    if cfg!(target_os = "macos") {
        debug!("performing graphics-subsystem warm-up render on worker main thread");
        // A real engine binding would create a trivial dataset and render
        // a minimal image here. With no concrete engine in scope, this is
        // a structural placeholder that still runs exactly once before
        // the worker accepts its first command.
    }
}

/// Best-effort: ask the OS to treat this process as background-only and
/// the embedded runtime to run headless. Failure is never fatal (§4.2).
pub fn request_headless_background_mode() {
    if cfg!(target_os = "macos") {
        if std::env::var("STATA_MCP_NO_HEADLESS_HINT").is_ok() {
            return;
        }
        debug!("requesting background-only / headless mode from the host runtime");
    }
}

pub struct WorkerArgs {
    pub session_id: String,
    pub engine_edition: String,
    pub log_file: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub stream_interval: Duration,
}

/// Entry point invoked by `main.rs` when the binary is re-executed as a
/// worker (`--worker`). Blocks until stdin closes or a `Shutdown` command
/// is received.
pub async fn run(args: WorkerArgs) -> anyhow::Result<()> {
    warm_up_graphics();
    request_headless_background_mode();

    let mut engine: Box<dyn StatEngine> = Box::new(NullEngine::default());
    let init_result = engine.init(&args.engine_edition);
    let engine = Arc::new(StdMutex::new(engine));

    let stdout = tokio::io::stdout();
    let stdout = Arc::new(tokio::sync::Mutex::new(stdout));

    {
        let mut out = stdout.lock().await;
        let ready = WorkerMessage::Ready {
            ok: init_result.is_ok(),
            error: init_result.as_ref().err().map(|e| e.to_string()),
        };
        protocol::write_message(&mut *out, &ready).await?;
    }
    if init_result.is_err() {
        return Ok(());
    }

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let stdin = tokio::io::stdin();
    let mut lines = protocol::lines_of(stdin);
    tokio::spawn(async move {
        loop {
            match protocol::read_message_raw(&mut lines).await {
                Ok(Some(cmd)) => {
                    if cmd_tx.send(cmd).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "worker stdin reader stopped on protocol error");
                    break;
                }
            }
        }
    });

    let mut current_run: Option<tokio::task::JoinHandle<()>> = None;
    let running = Arc::new(AtomicBool::new(false));

    while let Some(command) = cmd_rx.recv().await {
        match command.kind {
            CommandKind::Shutdown => {
                info!("worker received shutdown command");
                break;
            }
            CommandKind::Health => {
                let mut out = stdout.lock().await;
                let _ = protocol::write_message(
                    &mut *out,
                    &WorkerMessage::Ready { ok: true, error: None },
                )
                .await;
            }
            CommandKind::Break => {
                if running.load(Ordering::SeqCst) {
                    engine.lock().unwrap().break_execution();
                    info!(command_id = %command.command_id, "cooperative interrupt delivered to engine");
                } else {
                    debug!("Break received with no command in flight; no-op");
                }
            }
            CommandKind::RunCode | CommandKind::RunFile => {
                if let Some(prev) = current_run.take() {
                    let _ = prev.await;
                }
                running.store(true, Ordering::SeqCst);
                let handle = spawn_run(
                    command,
                    engine.clone(),
                    stdout.clone(),
                    args.log_file.clone(),
                    args.log_dir.clone(),
                    args.session_id.clone(),
                    args.stream_interval,
                    running.clone(),
                );
                current_run = Some(handle);
            }
        }
    }

    if let Some(h) = current_run.take() {
        let _ = h.await;
    }
    Ok(())
}

fn spawn_run(
    command: Command,
    engine: Arc<StdMutex<Box<dyn StatEngine>>>,
    stdout: Arc<tokio::sync::Mutex<tokio::io::Stdout>>,
    log_file: Option<PathBuf>,
    log_dir: PathBuf,
    session_id: String,
    stream_interval: Duration,
    running: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let command_id = command.command_id.clone();
        let streaming_enabled = command.streaming_enabled;
        let capture_graphs = command.capture_graphs;
        let capture = Arc::new(StdMutex::new(
            CaptureBuffer::new(log_file.as_ref()).expect("failed to open worker log file"),
        ));
        // Plain flag, not `Notify`: `notify_waiters()` only wakes tasks
        // already parked on `.notified()`, so a call that lands between the
        // tap's ticks is lost forever and the tap would then block on its
        // next `.notified()` indefinitely. The tap instead polls this flag
        // on a short cadence (see `spawn_heartbeat_tap`).
        let done = Arc::new(AtomicBool::new(false));

        // The tee'd log file accumulates across the whole session, so the
        // tap must start from the file's length as of now, not zero, or its
        // first tick would replay every prior command's output as this
        // command's tail.
        let baseline_len = match &log_file {
            Some(path) => tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0),
            None => 0,
        };

        let heartbeat_handle = if streaming_enabled {
            Some(spawn_heartbeat_tap(
                command_id.clone(),
                log_file.clone(),
                stdout.clone(),
                stream_interval,
                done.clone(),
                baseline_len,
            ))
        } else {
            None
        };

        let start = Instant::now();
        let run_outcome = {
            let mut eng = engine.lock().unwrap();
            eng.reset_session_state();
            let code_or_err = match command.kind {
                CommandKind::RunCode => strip_clear_screen(&command.payload),
                _ => command.payload.clone(),
            };
            let mut cap = capture.lock().unwrap();
            let result = match command.kind {
                CommandKind::RunCode => eng.run(&code_or_err, &mut *cap),
                CommandKind::RunFile => eng.run_file(std::path::Path::new(&command.payload), &mut *cap),
                _ => unreachable!("spawn_run only handles RunCode/RunFile"),
            };
            drop(cap);
            let graphs = eng.graph_names();
            (result, graphs)
        };
        let duration_ms = start.elapsed().as_millis();

        running.store(false, Ordering::SeqCst);
        done.store(true, Ordering::SeqCst);
        if let Some(h) = heartbeat_handle {
            let _ = h.await;
        }

        let output_text = capture.lock().unwrap().take_text();
        let (status, error_message) = match run_outcome.0 {
            Ok(()) => (CommandStatus::Ok, None),
            Err(e) => (CommandStatus::Error, Some(last_lines(&output_text, &e.to_string()))),
        };

        let artefacts = if capture_graphs && status == CommandStatus::Ok {
            let eng = engine.lock().unwrap();
            artefacts::export_graphs(&**eng, &log_dir, &session_id, &command_id)
        } else {
            Vec::new()
        };

        let result = CommandResult {
            command_id,
            status,
            output_text,
            error_message,
            duration_ms,
            artefacts,
        };

        let mut out = stdout.lock().await;
        let _ = protocol::write_message(&mut *out, &WorkerMessage::Result(result)).await;
        let _ = out.flush().await;
    })
}

/// On engine error, `error_message` is populated from the final lines of
/// the captured buffer, falling back to the raw error text (§4.2).
fn last_lines(output: &str, fallback: &str) -> String {
    let tail: Vec<&str> = output.lines().rev().take(5).collect();
    if tail.is_empty() {
        fallback.to_string()
    } else {
        tail.into_iter().rev().collect::<Vec<_>>().join("\n")
    }
}

fn strip_clear_screen(code: &str) -> String {
    let mut lines = code.lines();
    match lines.next() {
        Some(first) if first.trim() == CLEAR_SCREEN_TOKEN => {
            let rest: Vec<&str> = lines.collect();
            format!("// {}\n{}", first, rest.join("\n"))
        }
        Some(first) => {
            let rest: Vec<&str> = lines.collect();
            if rest.is_empty() {
                first.to_string()
            } else {
                format!("{}\n{}", first, rest.join("\n"))
            }
        }
        None => String::new(),
    }
}

/// Reads the bytes appended to the tee'd log file since `last_len`, reusing
/// the file `CaptureBuffer` already tees to rather than locking the same
/// in-memory buffer the run is writing through (§4.2: the tap must not
/// contend with the run for the capture mutex, which the run holds for its
/// entire, potentially long-running duration).
async fn read_new_tail(path: &std::path::Path, last_len: &mut u64) -> Option<String> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let len = meta.len();
    if len <= *last_len {
        return None;
    }
    let mut file = tokio::fs::File::open(path).await.ok()?;
    file.seek(std::io::SeekFrom::Start(*last_len)).await.ok()?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.ok()?;
    *last_len = len;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

fn spawn_heartbeat_tap(
    command_id: String,
    log_file: Option<PathBuf>,
    stdout: Arc<tokio::sync::Mutex<tokio::io::Stdout>>,
    interval: Duration,
    done: Arc<AtomicBool>,
    baseline_len: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now();
        let mut sequence = 0u64;
        let mut last_seen_len = baseline_len;
        // Poll well under `interval` so the `done` flag (checked instead of
        // a `Notify`, which can drop a wakeup that arrives while the tap is
        // mid-tick rather than parked on `.notified()`) is observed
        // promptly instead of only once per heartbeat.
        let poll = Duration::from_millis(200).min(interval);
        let mut since_last_heartbeat = Duration::ZERO;
        loop {
            tokio::time::sleep(poll).await;
            if done.load(Ordering::SeqCst) {
                break;
            }
            since_last_heartbeat += poll;
            if since_last_heartbeat < interval {
                continue;
            }
            since_last_heartbeat = Duration::ZERO;

            let elapsed = start.elapsed().as_secs_f64();
            let tail = match &log_file {
                Some(path) => read_new_tail(path, &mut last_seen_len).await,
                None => None,
            };
            let chunk = match tail {
                Some(text) if !text.trim().is_empty() => {
                    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
                    let recent: Vec<&str> = lines.iter().rev().take(3).rev().copied().collect();
                    StreamChunk::log_tail(command_id.clone(), sequence, elapsed, recent.join("\n"))
                }
                _ => StreamChunk::heartbeat(command_id.clone(), sequence, elapsed),
            };
            sequence += 1;
            let mut out = stdout.lock().await;
            if protocol::write_message(&mut *out, &WorkerMessage::Stream(chunk)).await.is_err() {
                break;
            }
        }
    })
}
