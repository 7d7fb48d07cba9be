use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::protocol::ReplResponse;

/// Errors that can occur while managing or talking to REPL processes.
#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    /// The REPL executable could not be launched.
    #[error("Failed to spawn REPL process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Priming or interaction exceeded the caller-supplied timeout.
    #[error("REPL operation timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// The process was killed or closed; no I/O was attempted.
    #[error("REPL process is dead")]
    DeadProcess,

    /// The process closed its output stream in the middle of an exchange.
    #[error("REPL process exited unexpectedly")]
    ProcessDied,

    /// Sending the header to a fresh process failed.
    #[error("Failed to prime REPL: {0}")]
    Prime(String),

    /// JSON parse error or unexpected response format.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid pool or process configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// `release` was called for a process that is not checked out.
    #[error("REPL {0} is not checked out")]
    NotCheckedOut(Uuid),

    /// The pool has been cleaned up and no longer hands out processes.
    #[error("REPL pool is shut down")]
    ShutDown,

    /// IO error from process communication.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReplError {
    /// Whether this failure belongs to the request that caused it rather than
    /// to the service (a slow snippet, a process that died under it).
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            ReplError::Timeout(_) | ReplError::DeadProcess | ReplError::ProcessDied
        )
    }
}

/// One unit of work sent to a REPL.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Snippet {
    /// Caller-supplied identifier, used for logging only.
    pub id: String,
    /// Lean source to evaluate.
    pub code: String,
}

impl Snippet {
    pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
        }
    }
}

/// Response to a single interaction, with its wall-clock duration.
#[derive(Debug, Clone)]
pub struct ReplOutput {
    pub id: String,
    pub response: ReplResponse,
    pub time: Duration,
}

/// Configuration for the REPL pool.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReplConfig {
    /// Executable that starts the REPL (usually `lake`).
    #[serde(default = "default_repl_command")]
    pub command: PathBuf,

    /// Arguments passed to `command` (e.g. `["exe", "repl"]`).
    #[serde(default = "default_repl_args")]
    pub args: Vec<String>,

    /// Lean project directory used as the working directory of every process.
    pub working_dir: PathBuf,

    /// Maximum number of processes tracked at once (free + busy).
    #[serde(default = "default_max_repls")]
    pub max_repls: usize,

    /// Completed interactions before a process is retired. `None` = unlimited.
    #[serde(default)]
    pub max_repl_uses: Option<u64>,

    /// Address-space limit applied to each process, in MiB. `0` or `None`
    /// disables the limit.
    #[serde(default = "default_max_repl_mem_mb")]
    pub max_repl_mem_mb: Option<u64>,

    /// How long to wait for a killed process to be reaped.
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_secs: u64,

    /// Processes to start and prime at startup, keyed by header.
    #[serde(default)]
    pub init_repls: BTreeMap<String, usize>,
}

impl ReplConfig {
    /// Config for an arbitrary REPL command with default limits.
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir: working_dir.into(),
            max_repls: default_max_repls(),
            max_repl_uses: None,
            max_repl_mem_mb: default_max_repl_mem_mb(),
            kill_timeout_secs: default_kill_timeout(),
            init_repls: BTreeMap::new(),
        }
    }

    /// Create a `ReplConfig` for `lake exe repl` in an auto-discovered project.
    ///
    /// Returns `None` if [`discover_repl_project()`] finds nothing.
    pub fn with_discovered_project() -> Option<Self> {
        let project_dir = discover_repl_project()?;
        Some(Self::new(
            default_repl_command(),
            default_repl_args(),
            project_dir,
        ))
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    /// `RLIMIT_AS` value for each process, if a limit is configured.
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.max_repl_mem_mb
            .filter(|&mb| mb > 0)
            .map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

/// Configuration for the AST export gate.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ExportConfig {
    /// Executable used for module exports (usually `lake`).
    #[serde(default = "default_repl_command")]
    pub command: PathBuf,

    /// Arguments placed before the module name.
    #[serde(default = "default_export_args")]
    pub args: Vec<String>,

    /// Project directory the module exports run in.
    pub project_dir: PathBuf,

    /// Standalone exporter binary for source-code exports.
    /// Defaults to `<project_dir>/.lake/build/bin/ast-export`.
    #[serde(default)]
    pub export_bin: Option<PathBuf>,

    /// Maximum number of export subprocesses running at once.
    #[serde(default = "default_export_concurrency")]
    pub concurrency: usize,

    /// How long to wait for a killed exporter to be reaped.
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_secs: u64,
}

impl ExportConfig {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: default_repl_command(),
            args: default_export_args(),
            project_dir: project_dir.into(),
            export_bin: None,
            concurrency: default_export_concurrency(),
            kill_timeout_secs: default_kill_timeout(),
        }
    }

    pub fn export_bin(&self) -> PathBuf {
        self.export_bin.clone().unwrap_or_else(|| {
            self.project_dir
                .join(".lake")
                .join("build")
                .join("bin")
                .join("ast-export")
        })
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }
}

/// Auto-discover the Lean REPL project directory.
///
/// Checks the `LEAN_REPL_PROJECT` environment variable. A directory is
/// accepted if it contains `lakefile.lean` or `lakefile.toml`.
pub fn discover_repl_project() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var("LEAN_REPL_PROJECT").ok()?);
    if path.join("lakefile.lean").is_file() || path.join("lakefile.toml").is_file() {
        return Some(path);
    }
    tracing::warn!(
        "LEAN_REPL_PROJECT={} set but no lakefile found there",
        path.display()
    );
    None
}

fn default_repl_command() -> PathBuf {
    PathBuf::from("lake")
}
fn default_repl_args() -> Vec<String> {
    vec!["exe".to_string(), "repl".to_string()]
}
fn default_export_args() -> Vec<String> {
    vec!["exe".to_string(), "ast-export".to_string()]
}
fn default_max_repls() -> usize {
    4
}
fn default_max_repl_mem_mb() -> Option<u64> {
    Some(8192)
}
fn default_kill_timeout() -> u64 {
    5
}
fn default_export_concurrency() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_error_reports_fractional_seconds() {
        let err = ReplError::Timeout(Duration::from_millis(1));
        assert_eq!(err.to_string(), "REPL operation timed out after 0.001s");
    }

    #[test]
    fn user_facing_errors() {
        assert!(ReplError::Timeout(Duration::from_secs(1)).is_user_facing());
        assert!(ReplError::DeadProcess.is_user_facing());
        assert!(!ReplError::ShutDown.is_user_facing());
        assert!(!ReplError::Prime("bad header".into()).is_user_facing());
    }

    #[test]
    fn repl_config_defaults_from_json() {
        let config: ReplConfig =
            serde_json::from_str(r#"{"working_dir": "/tmp/project"}"#).unwrap();
        assert_eq!(config.command, PathBuf::from("lake"));
        assert_eq!(config.args, vec!["exe", "repl"]);
        assert_eq!(config.max_repls, 4);
        assert_eq!(config.max_repl_uses, None);
        assert_eq!(config.max_repl_mem_mb, Some(8192));
        assert!(config.init_repls.is_empty());
    }

    #[test]
    fn zero_memory_cap_means_unlimited() {
        let mut config = ReplConfig::new("lake", Vec::new(), "/tmp");
        assert_eq!(config.memory_limit_bytes(), Some(8192 * 1024 * 1024));

        let config_zero: ReplConfig =
            serde_json::from_str(r#"{"working_dir": "/tmp", "max_repl_mem_mb": 0}"#).unwrap();
        assert_eq!(config_zero.memory_limit_bytes(), None);

        config.max_repl_mem_mb = None;
        assert_eq!(config.memory_limit_bytes(), None);
    }

    #[test]
    fn export_bin_defaults_under_project() {
        let config = ExportConfig::new("/opt/ast");
        assert_eq!(
            config.export_bin(),
            PathBuf::from("/opt/ast/.lake/build/bin/ast-export")
        );
        assert_eq!(config.concurrency, 4);
    }
}
