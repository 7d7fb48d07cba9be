//! Concurrency-capped AST export jobs.
//!
//! Each job is a one-shot `ast-export` subprocess. Its outcome is always
//! returned as data: timeouts, non-zero exits and unreadable artifacts
//! become [`AstOutcome::Failure`] for that job only.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Semaphore;

use crate::terminate;
use crate::types::{ExportConfig, ReplError};

/// A single export request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportJob {
    /// Export a module of the configured project. With `one`, only that
    /// module is exported (`--one`).
    Module { module: String, one: bool },
    /// Export `code` as a virtual module named `module`.
    Code { module: String, code: String },
}

impl ExportJob {
    pub fn module(module: impl Into<String>, one: bool) -> Self {
        ExportJob::Module {
            module: module.into(),
            one,
        }
    }

    pub fn code(module: impl Into<String>, code: impl Into<String>) -> Self {
        ExportJob::Code {
            module: module.into(),
            code: code.into(),
        }
    }

    pub fn module_name(&self) -> &str {
        match self {
            ExportJob::Module { module, .. } | ExportJob::Code { module, .. } => module,
        }
    }
}

/// Either the parsed AST or an error message, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AstOutcome {
    #[serde(rename = "ast")]
    Success(serde_json::Value),
    #[serde(rename = "error")]
    Failure(String),
}

/// Result for one module. Serializes as `{"module", "ast"}` or
/// `{"module", "error"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AstModuleResult {
    pub module: String,
    #[serde(flatten)]
    pub outcome: AstOutcome,
}

impl AstModuleResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AstOutcome::Success(_))
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            AstOutcome::Failure(e) => Some(e),
            AstOutcome::Success(_) => None,
        }
    }
}

/// Runs export jobs with at most `concurrency` subprocesses alive at once.
pub struct AstExporter {
    config: ExportConfig,
    semaphore: Arc<Semaphore>,
}

impl AstExporter {
    pub fn new(config: ExportConfig) -> Result<Self, ReplError> {
        if config.concurrency == 0 {
            return Err(ReplError::Config("concurrency must be at least 1".into()));
        }
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Ok(Self { config, semaphore })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Number of jobs that could start right now without waiting.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run one job, waiting for a free slot first.
    ///
    /// The slot is held for the whole job and released on every path.
    pub async fn run(&self, job: &ExportJob, timeout: Duration) -> AstModuleResult {
        let module = job.module_name().to_string();
        if !is_valid_module_name(&module) {
            return AstModuleResult {
                module,
                outcome: AstOutcome::Failure("Invalid module name".into()),
            };
        }

        let outcome = match self.semaphore.acquire().await {
            Ok(_permit) => match job {
                ExportJob::Module { module, one } => {
                    self.export_module(module, *one, timeout).await
                }
                ExportJob::Code { module, code } => self.export_code(module, code, timeout).await,
            },
            Err(_) => AstOutcome::Failure("export gate closed".into()),
        };

        AstModuleResult { module, outcome }
    }

    /// Export several modules concurrently, one result per module in input
    /// order. A failed module never affects the others.
    pub async fn run_batch(
        &self,
        modules: &[String],
        one: bool,
        timeout: Duration,
    ) -> Vec<AstModuleResult> {
        let jobs: Vec<ExportJob> = modules
            .iter()
            .map(|m| ExportJob::module(m.clone(), one))
            .collect();
        futures::future::join_all(jobs.iter().map(|job| self.run(job, timeout))).await
    }

    /// Export source code as a virtual module.
    pub async fn run_code(&self, module: &str, code: &str, timeout: Duration) -> AstModuleResult {
        self.run(&ExportJob::code(module, code), timeout).await
    }

    async fn export_module(&self, module: &str, one: bool, timeout: Duration) -> AstOutcome {
        tracing::info!(module, one, "Exporting module AST");
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        if one {
            cmd.arg("--one");
        }
        cmd.arg(module);

        self.run_export(cmd, module, &self.config.project_dir, timeout)
            .await
    }

    async fn export_code(&self, module: &str, code: &str, timeout: Duration) -> AstOutcome {
        tracing::info!(module, len = code.len(), "Exporting AST from code");

        // Removed when dropped at the end of this function.
        let tmp = match tempfile::Builder::new().prefix("ast_code_").tempdir() {
            Ok(tmp) => tmp,
            Err(e) => return AstOutcome::Failure(format!("failed to create work dir: {e}")),
        };
        let src_dir = tmp.path().join("src");
        let source = module_path(&src_dir, module, "lean");
        let artifact = artifact_path(tmp.path(), module);

        let prepared = async {
            if let Some(parent) = source.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&source, code).await?;
            if let Some(parent) = artifact.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            std::env::join_paths([src_dir.as_path(), self.config.project_dir.as_path()])
                .map_err(std::io::Error::other)
        };
        let src_path = match prepared.await {
            Ok(path) => path,
            Err(e) => return AstOutcome::Failure(format!("failed to prepare module: {e}")),
        };

        let mut cmd = Command::new(self.config.export_bin());
        cmd.arg("--one").arg(module).env("LEAN_SRC_PATH", src_path);

        self.run_export(cmd, module, tmp.path(), timeout).await
    }

    /// Run a prepared export command in `cwd` and read its artifact.
    async fn run_export(
        &self,
        mut cmd: Command,
        module: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> AstOutcome {
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The exporter may start its own build; keep it in one group.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(module, error = %e, "Failed to spawn ast-export");
                return AstOutcome::Failure(format!("failed to spawn ast-export: {e}"));
            }
        };

        let stderr = child.stderr.take();
        let waited = tokio::time::timeout(timeout, wait_with_stderr(&mut child, stderr)).await;

        match waited {
            Err(_) => {
                if let Err(e) =
                    terminate::kill_process_safely(&mut child, true, self.config.kill_timeout())
                        .await
                {
                    tracing::error!(module, error = %e, "Failed to kill timed out ast-export");
                }
                tracing::error!(
                    module,
                    timeout_secs = timeout.as_secs_f64(),
                    "Timeout exporting module"
                );
                AstOutcome::Failure(format!("timed out after {}s", timeout.as_secs_f64()))
            }
            Ok(Err(e)) => {
                let _ = terminate::kill_process_safely(&mut child, true, self.config.kill_timeout())
                    .await;
                tracing::error!(module, error = %e, "Error waiting for ast-export");
                AstOutcome::Failure(e.to_string())
            }
            Ok(Ok((status, stderr))) if !status.success() => {
                tracing::error!(module, %status, stderr = %stderr.trim(), "Export failed");
                if stderr.trim().is_empty() {
                    AstOutcome::Failure("ast-export failed".into())
                } else {
                    AstOutcome::Failure(stderr)
                }
            }
            Ok(Ok(_)) => read_artifact(&artifact_path(cwd, module), module).await,
        }
    }
}

async fn wait_with_stderr(
    child: &mut Child,
    stderr: Option<ChildStderr>,
) -> std::io::Result<(ExitStatus, String)> {
    let mut buf = Vec::new();
    if let Some(mut stderr) = stderr {
        stderr.read_to_end(&mut buf).await?;
    }
    let status = child.wait().await?;
    Ok((status, String::from_utf8_lossy(&buf).into_owned()))
}

async fn read_artifact(path: &Path, module: &str) -> AstOutcome {
    let parsed = match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_json::from_str(&text).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    match parsed {
        Ok(ast) => {
            tracing::info!(module, "AST export succeeded");
            AstOutcome::Success(ast)
        }
        Err(e) => {
            tracing::error!(module, path = %path.display(), error = %e, "Failed to read AST");
            AstOutcome::Failure(format!("failed to read AST: {e}"))
        }
    }
}

/// Module names are dot-separated, non-empty segments of `[A-Za-z0-9_]`.
pub fn is_valid_module_name(module: &str) -> bool {
    !module.is_empty()
        && module.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

/// `root/A/B/C.<ext>` for module `A.B.C`.
fn module_path(root: &Path, module: &str, ext: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    let mut segments = module.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_some() {
            path.push(segment);
        } else {
            path.push(format!("{segment}.{ext}"));
        }
    }
    path
}

/// Where `ast-export --one` leaves the artifact for `module`.
pub fn artifact_path(root: &Path, module: &str) -> PathBuf {
    module_path(&root.join(".lake").join("build").join("lib"), module, "out.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_name_validation() {
        assert!(is_valid_module_name("Mathlib"));
        assert!(is_valid_module_name("Mathlib.Data.List.Basic"));
        assert!(is_valid_module_name("User_1.Code"));
        assert!(!is_valid_module_name(""));
        assert!(!is_valid_module_name("../etc"));
        assert!(!is_valid_module_name("A..B"));
        assert!(!is_valid_module_name("A B"));
        assert!(!is_valid_module_name("A;rm"));
    }

    #[test]
    fn artifact_path_mirrors_module() {
        let path = artifact_path(Path::new("/proj"), "Mathlib.Data.List");
        assert_eq!(
            path,
            PathBuf::from("/proj/.lake/build/lib/Mathlib/Data/List.out.json")
        );
        assert_eq!(
            module_path(Path::new("/tmp/src"), "User.Code", "lean"),
            PathBuf::from("/tmp/src/User/Code.lean")
        );
    }

    #[test]
    fn result_serializes_one_field() {
        let ok = AstModuleResult {
            module: "A".into(),
            outcome: AstOutcome::Success(serde_json::json!({"k": 1})),
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"module": "A", "ast": {"k": 1}})
        );

        let err = AstModuleResult {
            module: "B".into(),
            outcome: AstOutcome::Failure("boom".into()),
        };
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({"module": "B", "error": "boom"})
        );
        assert_eq!(err.error(), Some("boom"));
        assert!(!err.is_success());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = ExportConfig::new("/tmp");
        config.concurrency = 0;
        assert!(AstExporter::new(config).is_err());
    }

    #[tokio::test]
    async fn invalid_module_does_not_take_a_slot() {
        let exporter = AstExporter::new(ExportConfig::new("/nonexistent")).unwrap();
        let result = exporter
            .run(&ExportJob::module("bad name", true), Duration::from_secs(1))
            .await;
        assert_eq!(result.error(), Some("Invalid module name"));
        assert_eq!(exporter.available_slots(), 4);
    }

    #[tokio::test]
    async fn spawn_failure_is_captured() {
        let mut config = ExportConfig::new(std::env::temp_dir());
        config.command = PathBuf::from("/nonexistent/ast-export");
        let exporter = AstExporter::new(config).unwrap();

        let result = exporter
            .run(&ExportJob::module("Foo", true), Duration::from_secs(1))
            .await;
        assert!(result.error().unwrap().contains("failed to spawn"));
        assert_eq!(exporter.available_slots(), 4);
    }
}
