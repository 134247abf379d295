use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error).
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for log files. If None, no file logging and the server
    /// cannot answer log-content requests.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Prefix for log file names.
    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    /// Log rotation: "hourly", "daily", "never".
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// Whether to output JSON format.
    #[serde(default)]
    pub json_format: bool,

    /// Whether to also output to console (stdout).
    #[serde(default = "default_true")]
    pub console_output: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_prefix() -> String {
    "dfs-data-server".into()
}

fn default_rotation() -> String {
    "daily".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            log_dir: None,
            file_prefix: default_prefix(),
            rotation: default_rotation(),
            json_format: false,
            console_output: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogInitError {
    #[error("failed to create log file appender in {dir}: {source}")]
    Appender {
        dir: PathBuf,
        #[source]
        source: tracing_appender::rolling::InitError,
    },

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Initialize the logging system. Should be called once at program startup.
/// Returns a guard that must be held alive for the duration of the program
/// (for the non-blocking file writer).
pub fn init_logging(
    config: &LogConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, LogInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    // Build console layer (boxed to unify types).
    let console_layer: Option<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>> =
        if config.console_output {
            if config.json_format {
                Some(Box::new(fmt::layer().json()))
            } else {
                Some(Box::new(fmt::layer()))
            }
        } else {
            None
        };

    let (file_layer, guard): (
        Option<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>>,
        Option<tracing_appender::non_blocking::WorkerGuard>,
    ) = if let Some(ref log_dir) = config.log_dir {
        let rotation = match config.rotation.as_str() {
            "hourly" => rolling::Rotation::HOURLY,
            "never" => rolling::Rotation::NEVER,
            _ => rolling::Rotation::DAILY,
        };

        let file_appender = rolling::RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(&config.file_prefix)
            .filename_suffix("log")
            .build(log_dir)
            .map_err(|source| LogInitError::Appender {
                dir: log_dir.clone(),
                source,
            })?;

        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json_format {
            Box::new(fmt::layer().json().with_writer(non_blocking))
        } else {
            Box::new(fmt::layer().with_ansi(false).with_writer(non_blocking))
        };

        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    registry.with(console_layer).with(file_layer).try_init()?;

    Ok(guard)
}

/// The log file currently being written, i.e. the most recently modified
/// file in `log_dir` whose name starts with `file_prefix`.
///
/// Returns `None` when file logging is disabled or nothing has been written.
pub fn current_log_file(config: &LogConfig) -> Option<PathBuf> {
    let dir = config.log_dir.as_deref()?;
    newest_with_prefix(dir, &config.file_prefix)
}

fn newest_with_prefix(dir: &Path, prefix: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some((meta.modified().ok()?, e.path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_default_config() {
        let cfg = LogConfig::default();
        assert_eq!(cfg.level, "info");
        assert_eq!(cfg.file_prefix, "dfs-data-server");
        assert!(cfg.log_dir.is_none());
        assert!(cfg.console_output);
    }

    #[test]
    fn test_parse_partial_toml() {
        let cfg: LogConfig = toml::from_str("level = \"debug\"\nlog_dir = \"/var/log/dfs\"").unwrap();
        assert_eq!(cfg.level, "debug");
        assert_eq!(cfg.log_dir, Some(PathBuf::from("/var/log/dfs")));
        assert_eq!(cfg.rotation, "daily");
    }

    #[test]
    fn test_current_log_file_none_without_dir() {
        assert!(current_log_file(&LogConfig::default()).is_none());
    }

    #[test]
    fn test_current_log_file_picks_newest() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("dfs-data-server.2026-01-01.log");
        let new = dir.path().join("dfs-data-server.2026-01-02.log");
        let other = dir.path().join("unrelated.log");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&new, b"new").unwrap();
        std::fs::write(&other, b"other").unwrap();

        let past = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let cfg = LogConfig {
            log_dir: Some(dir.path().to_path_buf()),
            ..LogConfig::default()
        };
        assert_eq!(current_log_file(&cfg), Some(new));
    }

    #[test]
    fn test_current_log_file_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LogConfig {
            log_dir: Some(dir.path().to_path_buf()),
            ..LogConfig::default()
        };
        assert!(current_log_file(&cfg).is_none());
    }
}
