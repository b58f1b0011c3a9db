// crates/observability/src/lib.rs
//! Tracing setup shared by the todo-progress binaries.
//!
//! - Filter from `RUST_LOG`, falling back to [`DEFAULT_FILTER`]
//! - Human-readable or JSON lines on stderr
//! - Optional daily-rolling log file through a non-blocking writer

use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "warn,todo_progress=info";

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter applied when `RUST_LOG` is not set.
    pub default_filter: String,
    /// Emit JSON lines instead of the compact human format.
    pub json: bool,
    /// Directory for the rolling log file. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: DEFAULT_FILTER.to_string(),
            json: false,
            log_dir: None,
            file_prefix: "todo-progress.log".to_string(),
        }
    }
}

/// Keeps the file writer alive. Dropping it flushes and closes the file.
#[must_use = "logs written to the file are lost once the guard is dropped"]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// `RUST_LOG` if it parses, else `default`.
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber.
pub fn init(config: &LogConfig) -> anyhow::Result<LoggingGuard> {
    let stderr_layer = if config.json {
        fmt::layer().json().with_writer(io::stderr).boxed()
    } else {
        fmt::layer().compact().with_writer(io::stderr).boxed()
    };

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = if config.json {
                fmt::layer().json().with_writer(writer).boxed()
            } else {
                fmt::layer().with_ansi(false).with_writer(writer).boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(&config.default_filter))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.default_filter, "warn,todo_progress=info");
        assert!(!config.json);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_writes_rolling_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let config = LogConfig {
            default_filter: "info".into(),
            log_dir: Some(log_dir.clone()),
            ..LogConfig::default()
        };

        let guard = init(&config).unwrap();
        tracing::info!(job_id = "j1", "job settled");
        drop(guard);

        let entries: Vec<String> = fs::read_dir(&log_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries.len(), 1, "{entries:?}");
        assert!(entries[0].starts_with("todo-progress.log"));

        // The global subscriber can only be installed once per process.
        assert!(init(&LogConfig::default()).is_err());
    }
}
