//! TOML config loading for the REPL server CLI.
//!
//! Deserializes `configs/server.toml`, which has `[repl]` and `[ast]`
//! sections, then merges with CLI overrides.

use std::path::Path;

use repl_pool::{ExportConfig, ReplConfig};
use serde::Deserialize;

/// Top-level structure matching `configs/server.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct ServerToml {
    /// REPL pool settings. Falls back to `LEAN_REPL_PROJECT` discovery.
    pub repl: Option<ReplConfig>,
    /// AST export settings. Required by the `ast` subcommands.
    pub ast: Option<ExportConfig>,
}

/// Load and deserialize a `ServerToml` from a TOML file.
pub fn load_server_toml(path: &Path) -> anyhow::Result<ServerToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
    let config: ServerToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded server config");
    Ok(config)
}

/// Build the pool config from TOML and CLI flags.
///
/// Priority chain: discovered defaults < `[repl]` < CLI `--max-repls`.
pub fn build_repl_config(
    toml: &ServerToml,
    max_repls_cli: Option<usize>,
) -> anyhow::Result<ReplConfig> {
    let mut config = match &toml.repl {
        Some(repl) => repl.clone(),
        None => ReplConfig::with_discovered_project().ok_or_else(|| {
            anyhow::anyhow!("No [repl] section in config and LEAN_REPL_PROJECT is not set")
        })?,
    };

    if let Some(n) = max_repls_cli {
        config.max_repls = n;
    }
    Ok(config)
}

/// Build the export config from the `[ast]` section and CLI flags.
pub fn build_export_config(
    toml: &ServerToml,
    concurrency_cli: Option<usize>,
) -> anyhow::Result<ExportConfig> {
    let mut config = toml
        .ast
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No [ast] section in config"))?;

    if let Some(n) = concurrency_cli {
        config.concurrency = n;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const FULL: &str = r#"
[repl]
working_dir = "/opt/repl"
max_repls = 8
max_repl_uses = 100
max_repl_mem_mb = 4096

[repl.init_repls]
"import Mathlib" = 2
"" = 1

[ast]
project_dir = "/opt/ast"
concurrency = 2
"#;

    #[test]
    fn test_deserialize_full_server_toml() {
        let config: ServerToml = toml::from_str(FULL).unwrap();

        let repl = config.repl.unwrap();
        assert_eq!(repl.working_dir, PathBuf::from("/opt/repl"));
        assert_eq!(repl.command, PathBuf::from("lake"));
        assert_eq!(repl.max_repls, 8);
        assert_eq!(repl.max_repl_uses, Some(100));
        assert_eq!(repl.max_repl_mem_mb, Some(4096));
        assert_eq!(repl.init_repls.get("import Mathlib"), Some(&2));
        assert_eq!(repl.init_repls.get(""), Some(&1));

        let ast = config.ast.unwrap();
        assert_eq!(ast.project_dir, PathBuf::from("/opt/ast"));
        assert_eq!(ast.concurrency, 2);
        assert_eq!(ast.args, vec!["exe", "ast-export"]);
    }

    #[test]
    fn test_zero_memory_cap_disables_limit() {
        let config: ServerToml = toml::from_str(
            r#"
[repl]
working_dir = "/opt/repl"
max_repl_mem_mb = 0
"#,
        )
        .unwrap();
        let repl = build_repl_config(&config, None).unwrap();
        assert_eq!(repl.max_repl_mem_mb, Some(0));
        assert_eq!(repl.memory_limit_bytes(), None);
    }

    #[test]
    fn test_sections_are_optional() {
        let config: ServerToml = toml::from_str("").unwrap();
        assert!(config.repl.is_none());
        assert!(config.ast.is_none());
        assert!(build_export_config(&config, None).is_err());
    }

    #[test]
    fn test_cli_override_priority() {
        let config: ServerToml = toml::from_str(FULL).unwrap();

        assert_eq!(build_repl_config(&config, None).unwrap().max_repls, 8);
        assert_eq!(build_repl_config(&config, Some(16)).unwrap().max_repls, 16);
        assert_eq!(build_export_config(&config, None).unwrap().concurrency, 2);
        assert_eq!(build_export_config(&config, Some(6)).unwrap().concurrency, 6);
    }

    #[test]
    fn test_shipped_config_parses() {
        let config: ServerToml =
            toml::from_str(include_str!("../../../configs/server.toml")).unwrap();
        let repl = config.repl.unwrap();
        assert_eq!(repl.max_repl_uses, Some(200));
        assert_eq!(repl.init_repls.get("import Mathlib"), Some(&2));
        assert!(config.ast.is_some());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, FULL).unwrap();

        let config = load_server_toml(&path).unwrap();
        assert!(config.repl.is_some());
        assert!(load_server_toml(&dir.path().join("missing.toml")).is_err());
    }
}
