//! Pooled Lean 4 REPL processes and gated AST export jobs.
//!
//! Starting a Lean REPL (and loading its imports) takes seconds, so this
//! crate keeps warm processes in a bounded pool and hands them out per
//! request. Processes are retired after a configurable number of uses, run
//! under an address-space limit, and are always killed together with their
//! descendants through their process group.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use repl_pool::{ReplConfig, ReplManager, Snippet};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ReplConfig::with_discovered_project()
//!     .expect("set LEAN_REPL_PROJECT to a Lean REPL checkout");
//! let manager = ReplManager::new(config)?;
//!
//! let timeout = Duration::from_secs(60);
//! let repl = manager.checkout("import Mathlib", "snippet-1", timeout, true).await?;
//! let result = repl.interact(&Snippet::new("snippet-1", "#eval 1 + 1"), timeout).await;
//! manager.release(&repl).await?;
//!
//! println!("{:?}", result?.response);
//! manager.cleanup().await;
//! # Ok(())
//! # }
//! ```
//!
//! AST exports do not use the pool:
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use repl_pool::{AstExporter, ExportConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let exporter = AstExporter::new(ExportConfig::new("/path/to/ast-export-project"))?;
//! let modules = vec!["Mathlib.Logic.Basic".to_string()];
//! for result in exporter.run_batch(&modules, true, Duration::from_secs(60)).await {
//!     println!("{}: success={}", result.module, result.is_success());
//! }
//! # Ok(())
//! # }
//! ```

pub mod export;
pub mod manager;
pub mod protocol;
pub mod repl;
pub mod terminate;
pub mod types;

pub use export::{AstExporter, AstModuleResult, AstOutcome, ExportJob};
pub use manager::{PoolStats, ReplManager};
pub use protocol::{Message, ReplCommand, ReplResponse, Severity};
pub use repl::{Repl, ReplState};
pub use types::{discover_repl_project, ExportConfig, ReplConfig, ReplError, ReplOutput, Snippet};
