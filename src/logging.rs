//! Logging setup for the binary

use crate::config::CleanupConfig;
use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter variable read before `RUST_LOG`
pub const LOG_ENV: &str = "BUILD_REAPER_LOG";
const DEFAULT_FILTER: &str = "info,build_reaper=debug";

/// Pick the filter directives: `--log-level`, then `BUILD_REAPER_LOG`, then
/// `RUST_LOG`, then the built-in default.
fn filter_directives(log_level: Option<&str>) -> String {
    log_level
        .map(str::to_string)
        .or_else(|| std::env::var(LOG_ENV).ok())
        .or_else(|| std::env::var(EnvFilter::DEFAULT_ENV).ok())
        .filter(|directives| !directives.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {}", path.display()))
}

/// Install the global subscriber for one cleanup run.
///
/// Human output goes to stderr so report lines on stdout stay parseable.
/// With `log_file` configured, a plain copy is appended there as well.
pub fn init_logger(log_level: Option<&str>, config: &CleanupConfig) -> Result<()> {
    let directives = filter_directives(log_level);
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log filter {directives:?}"))?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .compact();

    let file_layer = match &config.log_file {
        Some(path) => Some(
            fmt::layer()
                .with_writer(Mutex::new(open_log_file(path)?))
                .with_ansi(false)
                .with_target(true),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("a global logger is already installed")?;

    tracing::debug!(
        registry = %config.registry_path().display(),
        home_dir = %config.home_dir.display(),
        version = config.version.as_deref().unwrap_or("-"),
        build_id = config.build_id.as_deref().unwrap_or("-"),
        "cleanup configuration resolved"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        std::env::remove_var(LOG_ENV);
        std::env::remove_var(EnvFilter::DEFAULT_ENV);
    }

    #[test]
    #[serial]
    fn flag_beats_environment() {
        clear_env();
        std::env::set_var(LOG_ENV, "warn");
        assert_eq!(filter_directives(Some("trace")), "trace");
        assert_eq!(filter_directives(None), "warn");
        clear_env();
    }

    #[test]
    #[serial]
    fn own_variable_beats_rust_log() {
        clear_env();
        std::env::set_var(EnvFilter::DEFAULT_ENV, "error");
        assert_eq!(filter_directives(None), "error");
        std::env::set_var(LOG_ENV, "debug");
        assert_eq!(filter_directives(None), "debug");
        clear_env();
    }

    #[test]
    #[serial]
    fn blank_filter_falls_back_to_default() {
        clear_env();
        assert_eq!(filter_directives(None), DEFAULT_FILTER);
        assert_eq!(filter_directives(Some("  ")), DEFAULT_FILTER);
    }

    #[test]
    fn log_file_parent_is_created() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs/nested/reaper.log");
        open_log_file(&path).unwrap();
        assert!(path.is_file());
    }
}
