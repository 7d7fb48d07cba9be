//! Subcommand implementations: snippet checking and AST export.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use repl_pool::{
    AstExporter, AstModuleResult, ReplError, ReplManager, ReplOutput, ReplResponse, Snippet,
};

use crate::config::{build_export_config, build_repl_config, load_server_toml};
use crate::snippet::split_header;

/// Arguments for the `check` subcommand.
#[derive(Debug)]
pub struct CheckArgs {
    /// Path to the server config TOML file.
    pub config: PathBuf,
    /// JSON file holding `[{"id", "code"}]`.
    pub input: PathBuf,
    /// Per-snippet timeout for priming and evaluation.
    pub timeout_secs: u64,
    /// Always start a fresh REPL instead of reusing a primed one.
    pub no_reuse: bool,
    /// Optional CLI override for the pool size.
    pub max_repls: Option<usize>,
}

/// Arguments for the `ast` subcommand.
#[derive(Debug)]
pub struct AstArgs {
    pub config: PathBuf,
    pub modules: Vec<String>,
    /// Export dependencies too (omit `--one`).
    pub all: bool,
    pub timeout_secs: u64,
    pub ast_concurrency: Option<usize>,
}

/// Arguments for the `ast-code` subcommand.
#[derive(Debug)]
pub struct AstCodeArgs {
    pub config: PathBuf,
    pub file: PathBuf,
    pub module: String,
    pub timeout_secs: u64,
}

/// Outcome of checking one snippet. Exactly one of `response`/`error` is set.
#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ReplResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub time_secs: f64,
}

#[derive(Serialize)]
struct AstResponse<'a> {
    results: &'a [AstModuleResult],
}

/// Evaluate a batch of snippets through the REPL pool and print one JSON
/// line per snippet, in input order.
pub async fn run_check(args: CheckArgs) -> anyhow::Result<()> {
    let start = Instant::now();

    // 1. Load config and snippets
    let toml = load_server_toml(&args.config)?;
    let repl_config = build_repl_config(&toml, args.max_repls)?;
    let timeout = Duration::from_secs(args.timeout_secs);
    let reuse = !args.no_reuse;

    let contents = std::fs::read_to_string(&args.input)?;
    let snippets: Vec<Snippet> = serde_json::from_str(&contents)?;
    tracing::info!(count = snippets.len(), "Loaded snippets");

    // 2. Start the pool
    let manager = Arc::new(ReplManager::new(repl_config)?);
    manager.initialize(timeout).await?;

    // 3. Run every snippet concurrently; the pool bounds the process count
    let pb = progress_bar(snippets.len())?;
    let checks = snippets.into_iter().map(|snippet| {
        let manager = Arc::clone(&manager);
        let pb = pb.clone();
        async move {
            let result = check_snippet(&manager, snippet, timeout, reuse).await;
            pb.inc(1);
            result
        }
    });

    let results = tokio::select! {
        results = futures::future::join_all(checks) => results,
        _ = tokio::signal::ctrl_c() => {
            pb.abandon_with_message("interrupted");
            tracing::warn!("Interrupted, shutting down REPL pool");
            manager.cleanup().await;
            anyhow::bail!("Interrupted");
        }
    };
    pb.finish_and_clear();
    manager.cleanup().await;

    // 4. Report
    for result in &results {
        println!("{}", serde_json::to_string(result)?);
    }
    let failed = results.iter().filter(|r| r.error.is_some()).count();
    tracing::info!(
        total = results.len(),
        failed,
        elapsed_s = start.elapsed().as_secs_f64(),
        "Check complete"
    );
    Ok(())
}

async fn check_snippet(
    manager: &ReplManager,
    snippet: Snippet,
    timeout: Duration,
    reuse: bool,
) -> CheckResult {
    let start = Instant::now();
    let (header, body) = split_header(&snippet.code);
    let body = Snippet::new(snippet.id.clone(), body);

    match evaluate(manager, &header, &body, timeout, reuse).await {
        Ok(output) => CheckResult {
            id: snippet.id,
            response: Some(output.response),
            error: None,
            time_secs: output.time.as_secs_f64(),
        },
        Err(e) => {
            if e.is_user_facing() {
                tracing::info!(snippet = %snippet.id, error = %e, "Snippet failed");
            } else {
                tracing::error!(snippet = %snippet.id, error = %e, "REPL error");
            }
            CheckResult {
                id: snippet.id,
                response: None,
                error: Some(e.to_string()),
                time_secs: start.elapsed().as_secs_f64(),
            }
        }
    }
}

/// Checkout, evaluate, release. The REPL goes back to the pool even when
/// the evaluation failed; the pool decides whether it is still usable.
async fn evaluate(
    manager: &ReplManager,
    header: &str,
    body: &Snippet,
    timeout: Duration,
    reuse: bool,
) -> Result<ReplOutput, ReplError> {
    let repl = manager.checkout(header, &body.id, timeout, reuse).await?;
    let output = repl.interact(body, timeout).await;
    manager.release(&repl).await?;
    output
}

/// Export ASTs for a list of modules and print `{"results": [...]}`.
pub async fn run_ast(args: AstArgs) -> anyhow::Result<()> {
    let toml = load_server_toml(&args.config)?;
    let exporter = AstExporter::new(build_export_config(&toml, args.ast_concurrency)?)?;
    let timeout = Duration::from_secs(args.timeout_secs);

    tracing::info!(
        count = args.modules.len(),
        concurrency = exporter.config().concurrency,
        one = !args.all,
        "Exporting module ASTs"
    );

    let results = tokio::select! {
        results = exporter.run_batch(&args.modules, !args.all, timeout) => results,
        _ = tokio::signal::ctrl_c() => anyhow::bail!("Interrupted"),
    };
    print_ast_results(&results)
}

/// Export the AST of a Lean source file as a virtual module.
pub async fn run_ast_code(args: AstCodeArgs) -> anyhow::Result<()> {
    let toml = load_server_toml(&args.config)?;
    let exporter = AstExporter::new(build_export_config(&toml, None)?)?;
    let code = std::fs::read_to_string(&args.file)?;
    let timeout = Duration::from_secs(args.timeout_secs);

    let result = tokio::select! {
        result = exporter.run_code(&args.module, &code, timeout) => result,
        _ = tokio::signal::ctrl_c() => anyhow::bail!("Interrupted"),
    };
    print_ast_results(std::slice::from_ref(&result))
}

fn print_ast_results(results: &[AstModuleResult]) -> anyhow::Result<()> {
    let failed = results.iter().filter(|r| !r.is_success()).count();
    if failed > 0 {
        tracing::warn!(failed, total = results.len(), "Some AST exports failed");
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&AstResponse { results })?
    );
    Ok(())
}

fn progress_bar(len: usize) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("=> "),
    );
    Ok(pb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_result_serializes_one_outcome() {
        let ok = CheckResult {
            id: "a".into(),
            response: Some(ReplResponse {
                env: Some(3),
                ..Default::default()
            }),
            error: None,
            time_secs: 0.5,
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"id": "a", "response": {"env": 3}, "time_secs": 0.5})
        );

        let failed = CheckResult {
            id: "b".into(),
            response: None,
            error: Some("REPL process is dead".into()),
            time_secs: 0.0,
        };
        let value = serde_json::to_value(&failed).unwrap();
        assert!(value.get("response").is_none());
        assert_eq!(value["error"], "REPL process is dead");
    }

    #[test]
    fn ast_response_wraps_results() {
        let results = vec![AstModuleResult {
            module: "Lean".into(),
            outcome: repl_pool::AstOutcome::Failure("timed out after 1s".into()),
        }];
        let value = serde_json::to_value(AstResponse { results: &results }).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"results": [{"module": "Lean", "error": "timed out after 1s"}]})
        );
    }
}
