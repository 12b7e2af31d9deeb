// FILE: src/worker/mod.rs
//! Parent-side view of a Worker (§3, §4.2): an OS child process plus the
//! three message queues described in the data model. Spawning always uses
//! a clean-slate spawn primitive (`tokio::process::Command`, never
//! `fork`), per §5.

pub mod capture;
pub mod process;
pub mod protocol;

use crate::error::AppError;
use crate::model::{Command, CommandResult, StreamChunk, WorkerMessage};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// A spawned worker process plus its command/result/stream queues. Owned
/// exclusively by the `Session` that created it (§3 ownership).
pub struct WorkerHandle {
    child: Child,
    command_tx: mpsc::UnboundedSender<Command>,
    results_rx: mpsc::UnboundedReceiver<CommandResult>,
    stream_rx: mpsc::UnboundedReceiver<StreamChunk>,
    ready_rx: Option<oneshot::Receiver<Result<(), String>>>,
    pub created_at: Instant,
    pub last_heartbeat: std::sync::Mutex<Instant>,
}

pub struct SpawnOptions {
    pub exe_path: PathBuf,
    pub session_id: String,
    pub engine_edition: String,
    pub log_file: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub stream_interval: Duration,
}

impl WorkerHandle {
    /// Spawns the worker as a fresh process running `exe_path --worker`.
    /// The worker re-execs the same binary rather than forking, satisfying
    /// the Windows-compatible "clean-slate spawn primitive" requirement.
    pub fn spawn(opts: SpawnOptions) -> Result<Self, AppError> {
        let mut cmd = TokioCommand::new(&opts.exe_path);
        cmd.arg("--worker")
            .arg("--session-id")
            .arg(&opts.session_id)
            .arg("--engine-edition")
            .arg(&opts.engine_edition)
            .arg("--stream-interval-secs")
            .arg(opts.stream_interval.as_secs().to_string())
            .arg("--log-dir")
            .arg(&opts.log_dir);
        if let Some(log_file) = &opts.log_file {
            cmd.arg("--log-file").arg(log_file);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            AppError::WorkerDied(format!("failed to spawn worker process: {}", e))
        })?;

        let stdin = child.stdin.take().expect("worker stdin was piped");
        let stdout = child.stdout.take().expect("worker stdout was piped");

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<Command>();
        let (results_tx, results_rx) = mpsc::unbounded_channel::<CommandResult>();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel::<StreamChunk>();
        let (ready_tx, ready_rx) = oneshot::channel();

        // Writer task: serialises Commands onto the child's stdin.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(cmd) = command_rx.recv().await {
                if protocol::write_command(&mut stdin, &cmd).await.is_err() {
                    break;
                }
            }
            let _ = stdin.shutdown().await;
        });

        // Reader task: demultiplexes WorkerMessage frames from the child's
        // stdout into the results/stream channels (§3 "one message per
        // command" vs "many messages per command").
        tokio::spawn(async move {
            let mut lines = protocol::lines_of(stdout);
            let mut ready_tx = Some(ready_tx);
            loop {
                match protocol::read_message(&mut lines).await {
                    Ok(Some(WorkerMessage::Ready { ok, error })) => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(if ok { Ok(()) } else { Err(error.unwrap_or_default()) });
                        }
                    }
                    Ok(Some(WorkerMessage::Result(r))) => {
                        if results_tx.send(r).is_err() {
                            break;
                        }
                    }
                    Ok(Some(WorkerMessage::Stream(s))) => {
                        if stream_tx.send(s).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("worker stdout closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "worker protocol error, treating as worker death");
                        break;
                    }
                }
            }
        });

        Ok(WorkerHandle {
            child,
            command_tx,
            results_rx,
            stream_rx,
            ready_rx: Some(ready_rx),
            created_at: Instant::now(),
            last_heartbeat: std::sync::Mutex::new(Instant::now()),
        })
    }

    /// Waits for the worker's engine initialisation to complete, bounded
    /// by `worker_start_timeout` (§6 configuration table).
    pub async fn await_ready(&mut self, timeout: Duration) -> Result<(), AppError> {
        let rx = self
            .ready_rx
            .take()
            .ok_or_else(|| AppError::ProtocolError("await_ready called twice".into()))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(msg))) => Err(AppError::WorkerDied(format!("engine init failed: {}", msg))),
            Ok(Err(_)) => Err(AppError::WorkerDied("worker closed before signalling ready".into())),
            Err(_) => Err(AppError::WorkerDied("worker did not become ready in time".into())),
        }
    }

    pub fn send_command(&self, command: Command) -> Result<(), AppError> {
        self.command_tx
            .send(command)
            .map_err(|_| AppError::WorkerDied("command queue closed".into()))
    }

    pub async fn recv_result(&mut self) -> Option<CommandResult> {
        self.results_rx.recv().await
    }

    pub fn try_recv_stream(&mut self) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = self.stream_rx.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Forceful stage of the Termination Ladder (§4.3 stage 3).
    pub async fn kill(&mut self) -> Result<(), AppError> {
        info!(pid = ?self.pid(), "forcefully terminating worker process");
        self.child.start_kill()?;
        let _ = tokio::time::timeout(Duration::from_millis(500), self.child.wait()).await;
        Ok(())
    }

    /// True if the OS process has already exited, detected outside of an
    /// active command (§4.1 failure semantics).
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}
