// FILE: src/session_manager.rs
//! The Session Manager (§4.1): owns the set of workers keyed by session
//! id, enforces pool bounds, lazily creates and idle-reaps sessions, and
//! maintains the always-on default session for legacy callers. Grounded on
//! the teacher's `TerminalManager` (`Arc<StdMutex<HashMap<String,
//! Arc<ActiveSession>>>>`) generalised from shell sessions to engine
//! sessions, and on shpool's `daemon/server.rs` session table + idle
//! reaper shape.

use crate::config::Config;
use crate::error::AppError;
use crate::model::{ActivityClock, SessionId, SessionState, SessionView, DEFAULT_SESSION_ID};
use crate::worker::{SpawnOptions, WorkerHandle};
use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};
use uuid::Uuid;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

pub struct Session {
    pub id: SessionId,
    pub is_default: bool,
    pub created_at_ms: i64,
    pub activity: ActivityClock,
    pub state: PlMutex<SessionState>,
    /// Holding this mutex IS the single-execution lease (§3 invariant: at
    /// most one command in flight).
    pub worker: Arc<AsyncMutex<WorkerHandle>>,
}

impl Session {
    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id.clone(),
            state: *self.state.lock(),
            is_default: self.is_default,
            created_at_ms: self.created_at_ms,
            last_activity_at_ms: self.activity.get(),
        }
    }
}

/// The acquired execution lease for one session. Dropping it releases the
/// mutex; `release` additionally updates `last_activity_at`.
pub struct Lease {
    pub session: Arc<Session>,
    pub worker: OwnedMutexGuard<WorkerHandle>,
}

pub struct SessionManager {
    config: Arc<Config>,
    exe_path: PathBuf,
    index: PlMutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionManager {
    /// Creates the manager and eagerly creates the default session, per
    /// §4.1 ("created eagerly at startup").
    pub async fn new(config: Arc<Config>) -> Result<Arc<Self>, AppError> {
        let exe_path = std::env::current_exe().map_err(AppError::from)?;
        let manager = Arc::new(SessionManager {
            config,
            exe_path,
            index: PlMutex::new(HashMap::new()),
        });
        manager.spawn_session(DEFAULT_SESSION_ID.to_string(), true).await?;
        Ok(manager)
    }

    fn log_file_for(&self, session_id: &str) -> Option<PathBuf> {
        Some(self.config.log_directory().join(format!("{}.log", session_id)))
    }

    async fn spawn_session(self: &Arc<Self>, id: SessionId, is_default: bool) -> Result<Arc<Session>, AppError> {
        let opts = SpawnOptions {
            exe_path: self.exe_path.clone(),
            session_id: id.clone(),
            engine_edition: self.config.engine_edition.clone(),
            log_file: self.log_file_for(&id),
            log_dir: self.config.log_directory(),
            stream_interval: self.config.stream_interval,
        };
        let mut worker = match WorkerHandle::spawn(opts) {
            Ok(w) => w,
            Err(e) => {
                warn!(session_id = %id, error = %e, "worker spawn failed");
                return Err(e);
            }
        };
        if let Err(e) = worker.await_ready(self.config.worker_start_timeout).await {
            warn!(session_id = %id, error = %e, "worker failed to become ready");
            return Err(e);
        }

        let session = Arc::new(Session {
            id: id.clone(),
            is_default,
            created_at_ms: now_ms(),
            activity: ActivityClock::new(),
            state: PlMutex::new(SessionState::Ready),
            worker: Arc::new(AsyncMutex::new(worker)),
        });

        self.index.lock().insert(id.clone(), session.clone());
        info!(session_id = %id, is_default, "session ready");
        Ok(session)
    }

    #[instrument(skip(self))]
    pub async fn create_session(self: &Arc<Self>) -> Result<SessionId, AppError> {
        {
            let index = self.index.lock();
            if index.len() >= self.config.max_sessions {
                return Err(AppError::PoolFull);
            }
        }
        let id = Uuid::new_v4().to_string();
        match self.spawn_session(id.clone(), false).await {
            Ok(session) => Ok(session.id.clone()),
            Err(e) => {
                // Slot is released immediately: spawn_session never
                // inserted into the index on failure.
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub fn destroy_session(&self, id: &str) -> Result<(), AppError> {
        if id == DEFAULT_SESSION_ID {
            return Err(AppError::InvalidInputArgument(
                "the default session cannot be destroyed".to_string(),
            ));
        }
        let session = {
            let mut index = self.index.lock();
            index.remove(id)
        };
        match session {
            Some(session) => {
                *session.state.lock() = SessionState::Stopping;
                let worker = session.worker.clone();
                let sid = session.id.clone();
                tokio::spawn(async move {
                    let mut guard = worker.lock().await;
                    let _ = guard.kill().await;
                    info!(session_id = %sid, "session destroyed");
                });
                Ok(())
            }
            None => Err(AppError::SessionNotFound(id.to_string())),
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionView> {
        self.index.lock().values().map(|s| s.view()).collect()
    }

    fn resolve_id(id: Option<&str>) -> SessionId {
        id.filter(|s| !s.is_empty()).unwrap_or(DEFAULT_SESSION_ID).to_string()
    }

    /// True if `session_id` resolves to the default session. Callers use
    /// this to pick `acquire`'s `wait_if_busy` argument: the default session
    /// waits for its lease (legacy sequential semantics), explicit sessions
    /// fail fast (§4.3).
    pub fn is_default_target(session_id: Option<&str>) -> bool {
        Self::resolve_id(session_id) == DEFAULT_SESSION_ID
    }

    fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.index.lock().get(id).cloned()
    }

    /// `acquire` on the `default` sentinel always resolves; any other id
    /// requires a prior explicit `create_session` (§4.1).
    ///
    /// `wait_if_busy` controls whether a concurrent command causes this
    /// call to wait for the lease (legacy default-session semantics) or
    /// to fail fast with `BusyConflict` (explicit-session default, §4.3).
    pub async fn acquire(&self, session_id: Option<&str>, wait_if_busy: bool) -> Result<Lease, AppError> {
        let id = Self::resolve_id(session_id);
        let session = self.lookup(&id).ok_or_else(|| AppError::SessionNotFound(id.clone()))?;

        if matches!(
            *session.state.lock(),
            SessionState::Stopped | SessionState::Stopping | SessionState::InitFailed
        ) {
            return Err(AppError::SessionNotFound(id));
        }

        let worker = if wait_if_busy {
            session.worker.clone().lock_owned().await
        } else {
            session
                .worker
                .clone()
                .try_lock_owned()
                .map_err(|_| AppError::BusyConflict)?
        };

        *session.state.lock() = SessionState::Busy;
        Ok(Lease {
            session,
            worker,
        })
    }

    /// Releases a lease back to Ready and refreshes `last_activity_at`.
    /// Called by the Execution Controller when a command completes
    /// (§4.3 step 5).
    pub fn release(&self, lease: Lease) {
        lease.session.activity.touch();
        *lease.session.state.lock() = SessionState::Ready;
        drop(lease);
    }

    /// Marks a session Stopped after a fatal worker failure (worker death
    /// mid-run, or termination-ladder stage 3) and removes it from the
    /// index so subsequent lookups return `SessionNotFound` (§4.3, §7).
    /// The default session's slot is freed so the next `acquire("default")`
    /// triggers a lazy re-create.
    pub fn mark_stopped_and_remove(&self, session: &Arc<Session>) {
        *session.state.lock() = SessionState::Stopped;
        self.index.lock().remove(&session.id);
        warn!(session_id = %session.id, "session removed after worker failure");
    }

    /// Lazily re-creates the default session if it is missing, e.g. after
    /// the termination ladder killed it (§4.3).
    pub async fn ensure_default(self: &Arc<Self>) -> Result<(), AppError> {
        if self.lookup(DEFAULT_SESSION_ID).is_some() {
            return Ok(());
        }
        self.spawn_session(DEFAULT_SESSION_ID.to_string(), true).await?;
        Ok(())
    }

    /// Sweeps every non-Busy session for a worker process that has already
    /// exited on its own (crash, OOM-kill) and marks it Stopped immediately,
    /// rather than leaving it Ready-but-dead until the idle timeout elapses
    /// (§4.1, §4.3). Applies to the default session too: `ensure_default`
    /// lazily re-creates it on next use.
    fn reap_dead(&self) {
        let dead: Vec<Arc<Session>> = {
            let index = self.index.lock();
            index
                .values()
                .filter_map(|s| {
                    let mut worker = s.worker.try_lock().ok()?;
                    if worker.has_exited() {
                        Some(s.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };
        for session in dead {
            warn!(session_id = %session.id, "worker process exited unexpectedly, reaping");
            self.mark_stopped_and_remove(&session);
        }
    }

    /// Runs a single reaper sweep: first reaps sessions whose worker process
    /// has already died, then destroys sessions idle longer than
    /// `session_timeout`, skipping Busy sessions and the default session
    /// (§4.1). Running this twice in succession is idempotent (§8).
    #[instrument(skip(self))]
    pub fn reap_idle(&self) {
        self.reap_dead();

        let now = now_ms();
        let timeout_ms = self.config.session_timeout.as_millis() as i64;
        let victims: Vec<String> = {
            let index = self.index.lock();
            index
                .values()
                .filter(|s| !s.is_default)
                .filter(|s| now - s.activity.get() > timeout_ms)
                .filter(|s| s.worker.try_lock().is_ok()) // skip Busy sessions
                .map(|s| s.id.clone())
                .collect()
        };
        for id in victims {
            info!(session_id = %id, "reaping idle session");
            let _ = self.destroy_session(&id);
        }
    }

    /// Spawns the background reaper task at the configured cadence.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let manager = self.clone();
        let cadence = Duration::from_secs(60).min(manager.config.session_timeout.max(Duration::from_secs(1)));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            loop {
                ticker.tick().await;
                manager.reap_idle();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisplayMode, LogFileLocation, WorkingDirectoryPolicy};

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            engine_path: None,
            engine_edition: "default".to_string(),
            host: "localhost".to_string(),
            port: 0,
            force_port: false,
            max_sessions: 2,
            session_timeout: Duration::from_secs(60 * 30),
            worker_start_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(60),
            stream_interval: Duration::from_secs(6),
            max_output_tokens: 4000,
            result_display_mode: DisplayMode::Compact,
            log_file_location: LogFileLocation::ServerDir,
            custom_log_directory: None,
            working_directory_policy: WorkingDirectoryPolicy::None,
        })
    }

    // NOTE: these tests spawn the real binary as a worker subprocess via
    // `std::env::current_exe()`, which under `cargo test` is the test
    // harness binary, not `stata-mcp-server --worker`. They therefore
    // exercise pool-bound/index bookkeeping only, not a live worker
    // round-trip (that is covered by controller tests using a harness
    // that stubs `WorkerHandle` directly).
    #[test]
    fn resolve_id_defaults_to_sentinel() {
        assert_eq!(SessionManager::resolve_id(None), DEFAULT_SESSION_ID);
        assert_eq!(SessionManager::resolve_id(Some("")), DEFAULT_SESSION_ID);
        assert_eq!(SessionManager::resolve_id(Some("abc")), "abc");
    }

    #[test]
    fn pool_bound_is_read_from_config() {
        let cfg = test_config();
        assert_eq!(cfg.max_sessions, 2);
    }
}
