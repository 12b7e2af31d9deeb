// FILE: src/config.rs
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server-wide configuration, loaded once at startup from the environment
/// (optionally populated by a `.env` file) per §6's configuration table.
/// Every option has a documented default; nothing here is required.
#[derive(Debug, Clone)]
pub struct Config {
    pub engine_path: Option<PathBuf>,
    pub engine_edition: String,
    pub host: String,
    pub port: u16,
    pub force_port: bool,
    pub max_sessions: usize,
    pub session_timeout: Duration,
    pub worker_start_timeout: Duration,
    pub command_timeout: Duration,
    pub stream_interval: Duration,
    pub max_output_tokens: usize,
    pub result_display_mode: DisplayMode,
    pub log_file_location: LogFileLocation,
    pub custom_log_directory: Option<PathBuf>,
    pub working_directory_policy: WorkingDirectoryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Full,
    Compact,
}

impl FromStr for DisplayMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "full" => Ok(DisplayMode::Full),
            "compact" => Ok(DisplayMode::Compact),
            other => Err(anyhow::anyhow!("Invalid result_display_mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFileLocation {
    ServerDir,
    ScriptDir,
    ScriptParent,
    Workspace,
    Custom,
}

impl FromStr for LogFileLocation {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "server_dir" => Ok(LogFileLocation::ServerDir),
            "script_dir" => Ok(LogFileLocation::ScriptDir),
            "script_parent" => Ok(LogFileLocation::ScriptParent),
            "workspace" => Ok(LogFileLocation::Workspace),
            "custom" => Ok(LogFileLocation::Custom),
            other => Err(anyhow::anyhow!("Invalid log_file_location: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingDirectoryPolicy {
    ScriptDir,
    ScriptParent,
    Workspace,
    ServerDir,
    Custom,
    None,
}

impl FromStr for WorkingDirectoryPolicy {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "script_dir" => Ok(WorkingDirectoryPolicy::ScriptDir),
            "script_parent" => Ok(WorkingDirectoryPolicy::ScriptParent),
            "workspace" => Ok(WorkingDirectoryPolicy::Workspace),
            "server_dir" => Ok(WorkingDirectoryPolicy::ServerDir),
            "custom" => Ok(WorkingDirectoryPolicy::Custom),
            "none" => Ok(WorkingDirectoryPolicy::None),
            other => Err(anyhow::anyhow!("Invalid working_directory_policy: {}", other)),
        }
    }
}

fn expand_tilde(path_str: &str) -> Result<PathBuf> {
    shellexpand::tilde(path_str)
        .map(|cow_str| PathBuf::from(cow_str.as_ref()))
        .map_err(|e| anyhow::anyhow!("Failed to expand tilde for path '{}': {}", path_str, e))
}

fn env_duration_secs(key: &str, default_secs: u64) -> Result<Duration> {
    let secs = std::env::var(key)
        .ok()
        .map(|v| v.parse::<u64>().context(format!("Invalid {}", key)))
        .transpose()?
        .unwrap_or(default_secs);
    Ok(Duration::from_secs(secs))
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let engine_path = std::env::var("ENGINE_PATH")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| expand_tilde(&s))
            .transpose()?;
        let engine_edition = std::env::var("ENGINE_EDITION").unwrap_or_else(|_| "default".to_string());

        let host = std::env::var("HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = env_parse("PORT", 4000u16)?;
        let force_port = env_parse("FORCE_PORT", false)?;

        let max_sessions = env_parse("MAX_SESSIONS", 8usize)?;
        let session_timeout = env_duration_secs("SESSION_TIMEOUT_SECS", 30 * 60)?;
        let worker_start_timeout = env_duration_secs("WORKER_START_TIMEOUT_SECS", 30)?;
        let command_timeout = env_duration_secs("COMMAND_TIMEOUT_SECS", 10 * 60)?;
        let stream_interval = env_duration_secs("STREAM_INTERVAL_SECS", 6)?;
        let max_output_tokens = env_parse("MAX_OUTPUT_TOKENS", 4000usize)?;

        let result_display_mode = std::env::var("RESULT_DISPLAY_MODE")
            .ok()
            .map(|s| DisplayMode::from_str(&s))
            .transpose()?
            .unwrap_or(DisplayMode::Compact);

        let log_file_location = std::env::var("LOG_FILE_LOCATION")
            .ok()
            .map(|s| LogFileLocation::from_str(&s))
            .transpose()?
            .unwrap_or(LogFileLocation::ServerDir);

        let custom_log_directory = std::env::var("CUSTOM_LOG_DIRECTORY")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| expand_tilde(&s))
            .transpose()?;

        if log_file_location == LogFileLocation::Custom && custom_log_directory.is_none() {
            anyhow::bail!("LOG_FILE_LOCATION=custom requires CUSTOM_LOG_DIRECTORY to be set");
        }

        let working_directory_policy = std::env::var("WORKING_DIRECTORY_POLICY")
            .ok()
            .map(|s| WorkingDirectoryPolicy::from_str(&s))
            .transpose()?
            .unwrap_or(WorkingDirectoryPolicy::None);

        Ok(Config {
            engine_path,
            engine_edition,
            host,
            port,
            force_port,
            max_sessions,
            session_timeout,
            worker_start_timeout,
            command_timeout,
            stream_interval,
            max_output_tokens,
            result_display_mode,
            log_file_location,
            custom_log_directory,
            working_directory_policy,
        })
    }

    /// Directory engine log files and spill files live under, resolved per
    /// `log_file_location`. `script_dir`/`script_parent`/`workspace` need a
    /// per-command script path, so those variants fall back to the server
    /// directory here and are resolved precisely by the caller when a
    /// script path is available.
    pub fn log_directory(&self) -> PathBuf {
        match self.log_file_location {
            LogFileLocation::Custom => self
                .custom_log_directory
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("stata-mcp-logs")),
            _ => std::env::temp_dir().join("stata-mcp-logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mode_parses_case_insensitively() {
        assert_eq!(DisplayMode::from_str("Compact").unwrap(), DisplayMode::Compact);
        assert_eq!(DisplayMode::from_str("FULL").unwrap(), DisplayMode::Full);
        assert!(DisplayMode::from_str("bogus").is_err());
    }

    #[test]
    fn working_directory_policy_parses_all_variants() {
        for (s, expect) in [
            ("script_dir", WorkingDirectoryPolicy::ScriptDir),
            ("script_parent", WorkingDirectoryPolicy::ScriptParent),
            ("workspace", WorkingDirectoryPolicy::Workspace),
            ("server_dir", WorkingDirectoryPolicy::ServerDir),
            ("custom", WorkingDirectoryPolicy::Custom),
            ("none", WorkingDirectoryPolicy::None),
        ] {
            assert_eq!(WorkingDirectoryPolicy::from_str(s).unwrap(), expect);
        }
    }
}
