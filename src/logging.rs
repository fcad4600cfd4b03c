//! File logging for the add-on host.
//!
//! Logs are written to `~/.addon-host/logs/` with cleanup of files older
//! than the retention period.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Default log retention in hours.
pub const DEFAULT_LOG_RETENTION_HOURS: u32 = 24;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Whether logging is enabled.
    pub enabled: bool,
    /// Log level (trace, debug, info, warn, error, off).
    #[serde(deserialize_with = "deserialize_level")]
    pub level: String,
    /// Log retention period in hours.
    pub retention_hours: u32,
    /// Log directory override.
    pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: DEFAULT_LOG_LEVEL.to_string(),
            retention_hours: DEFAULT_LOG_RETENTION_HOURS,
            directory: None,
        }
    }
}

impl LogConfig {
    /// Normalizes a log level string.
    #[must_use]
    pub fn parse_level(value: &str) -> String {
        match value.trim().to_lowercase().as_str() {
            "trace" => "trace".to_string(),
            "debug" => "debug".to_string(),
            "info" => "info".to_string(),
            "warn" | "warning" => "warn".to_string(),
            "error" => "error".to_string(),
            "off" | "none" | "disabled" => "off".to_string(),
            _ => DEFAULT_LOG_LEVEL.to_string(),
        }
    }

    /// Directory log files are written to.
    #[must_use]
    pub fn log_directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| crate::config::host_dir().join("logs"))
    }
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(LogConfig::parse_level(&raw))
}

/// Deletes `.log` files older than the retention period.
///
/// # Errors
/// Returns error if the directory cannot be read.
pub fn cleanup_old_logs(config: &LogConfig) -> io::Result<u32> {
    let log_dir = config.log_directory();
    if !log_dir.exists() {
        return Ok(0);
    }

    let retention = Duration::from_secs(u64::from(config.retention_hours) * 3600);
    let now = SystemTime::now();
    let mut deleted = 0;

    for entry in fs::read_dir(&log_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }

        let age = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > retention) && fs::remove_file(&path).is_ok() {
            deleted += 1;
        }
    }

    Ok(deleted)
}

/// Initializes the global subscriber.
///
/// Returns the appender guard; dropping it flushes and stops the
/// background writer. Returns `None` when logging is disabled.
///
/// # Errors
/// Returns error if the log directory cannot be prepared.
pub fn init(config: &LogConfig) -> io::Result<Option<WorkerGuard>> {
    if !config.enabled || config.level == "off" {
        return Ok(None);
    }

    let log_dir = config.log_directory();
    fs::create_dir_all(&log_dir)?;
    let deleted = cleanup_old_logs(config)?;

    let file_name = format!(
        "addon-host_{}.log",
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let appender = tracing_appender::rolling::never(&log_dir, &file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .map_err(io::Error::other)?;

    tracing::info!("Add-on host logging initialized");
    tracing::info!("Log file: {}", log_dir.join(&file_name).display());
    tracing::info!("Log level: {}", config.level);
    if deleted > 0 {
        tracing::info!("Cleaned up {} old log file(s)", deleted);
    }

    Ok(Some(guard))
}
