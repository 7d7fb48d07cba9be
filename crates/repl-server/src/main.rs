mod config;
mod pipeline;
mod snippet;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{AstArgs, AstCodeArgs, CheckArgs};

/// repl-server: pooled Lean REPL checking and AST export.
#[derive(Parser)]
#[command(name = "repl-server", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate Lean snippets through a pool of REPL processes.
    Check {
        /// Path to server config TOML file.
        #[arg(long, default_value = "configs/server.toml")]
        config: PathBuf,
        /// JSON file with an array of `{"id", "code"}` snippets.
        #[arg(long)]
        input: PathBuf,
        /// Timeout in seconds for priming and for each evaluation.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        /// Start a fresh REPL for every snippet.
        #[arg(long)]
        no_reuse: bool,
        /// Override the maximum number of REPL processes.
        #[arg(long)]
        max_repls: Option<usize>,
    },
    /// Export ASTs for project modules.
    Ast {
        /// Path to server config TOML file.
        #[arg(long, default_value = "configs/server.toml")]
        config: PathBuf,
        /// Comma-separated module names (e.g. "Mathlib.Logic.Basic,Lean").
        #[arg(long, required = true, value_delimiter = ',')]
        modules: Vec<String>,
        /// Also export each module's dependencies.
        #[arg(long)]
        all: bool,
        /// Timeout in seconds per module.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        /// Override the number of concurrent export jobs.
        #[arg(long)]
        ast_concurrency: Option<usize>,
    },
    /// Export the AST of a Lean source file.
    AstCode {
        /// Path to server config TOML file.
        #[arg(long, default_value = "configs/server.toml")]
        config: PathBuf,
        /// Lean source file.
        #[arg(long)]
        file: PathBuf,
        /// Virtual module name to assign.
        #[arg(long, default_value = "User.Code")]
        module: String,
        /// Timeout in seconds.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Check {
            config,
            input,
            timeout,
            no_reuse,
            max_repls,
        } => {
            pipeline::run_check(CheckArgs {
                config,
                input,
                timeout_secs: timeout,
                no_reuse,
                max_repls,
            })
            .await
        }
        Command::Ast {
            config,
            modules,
            all,
            timeout,
            ast_concurrency,
        } => {
            pipeline::run_ast(AstArgs {
                config,
                modules,
                all,
                timeout_secs: timeout,
                ast_concurrency,
            })
            .await
        }
        Command::AstCode {
            config,
            file,
            module,
            timeout,
        } => {
            pipeline::run_ast_code(AstCodeArgs {
                config,
                file,
                module,
                timeout_secs: timeout,
            })
            .await
        }
    }
}
