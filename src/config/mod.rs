//! Configuration module for the add-on host.
//!
//! Handles loading and parsing `~/.addon-host/config.toml`.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::addon::descriptor::{DEFAULT_MANAGED_LAUNCHER, DescriptorResolver};
use crate::addon::supervisor::{
    DEFAULT_INVOKE_TIMEOUT, DEFAULT_RESTART_LIMIT, DEFAULT_STDERR_CAPACITY, InstanceOptions,
};
use crate::logging::LogConfig;

/// Default config file content with every setting documented.
pub const DEFAULT_CONFIG: &str = r#"# Add-on Host Configuration File
# ==============================
# Every setting is optional; the values below are the defaults.

# Milliseconds to wait for an add-on to answer a request.
invoke_timeout_ms = 5000

# Start attempts allowed per add-on within a rolling 60 second window.
restart_limit_per_minute = 3

# Recent stderr lines kept per add-on for diagnostics.
stderr_tail_capacity = 50

# Send a "ping" right after an add-on starts so broken add-ons fail early.
probe_on_start = true

# Launcher for add-ons whose entrypoint is a managed-runtime assembly (.dll).
managed_runtime_launcher = "dotnet"

# Add-on ids that must not be started.
disabled_addons = []

# Directory scanned for installed add-ons (default: ~/.addon-host/addons).
# addons_dir = "/path/to/addons"

[logging]
# Logs are stored in ~/.addon-host/logs/ with automatic cleanup.
enabled = true
level = "info"          # trace, debug, info, warn, error, off
retention_hours = 24
"#;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Milliseconds to wait for each response.
    pub invoke_timeout_ms: u64,
    /// Start attempts allowed per add-on per minute.
    pub restart_limit_per_minute: u32,
    /// Stderr lines kept per add-on.
    pub stderr_tail_capacity: usize,
    /// Ping add-ons right after they start.
    pub probe_on_start: bool,
    /// Launcher for managed-runtime entrypoints.
    pub managed_runtime_launcher: String,
    /// Add-on ids excluded from bulk start.
    pub disabled_addons: BTreeSet<String>,
    /// Directory scanned for installed add-ons.
    pub addons_dir: Option<PathBuf>,
    /// Logging configuration.
    pub logging: LogConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            invoke_timeout_ms: u64::try_from(DEFAULT_INVOKE_TIMEOUT.as_millis())
                .unwrap_or(u64::MAX),
            restart_limit_per_minute: DEFAULT_RESTART_LIMIT,
            stderr_tail_capacity: DEFAULT_STDERR_CAPACITY,
            probe_on_start: true,
            managed_runtime_launcher: DEFAULT_MANAGED_LAUNCHER.to_string(),
            disabled_addons: BTreeSet::new(),
            addons_dir: None,
            logging: LogConfig::default(),
        }
    }
}

/// Returns the host data directory (~/.addon-host).
#[must_use]
pub fn host_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".addon-host")
}

impl HostConfig {
    /// Returns the default config file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        host_dir().join("config.toml")
    }

    /// Loads configuration from a file, creating it with defaults if it
    /// doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            Self::create_default_config(path)?;
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parses configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.invoke_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "invoke_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.managed_runtime_launcher.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "managed_runtime_launcher must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(path, DEFAULT_CONFIG).map_err(io_error)
    }

    /// Directory scanned for installed add-ons.
    #[must_use]
    pub fn addons_dir(&self) -> PathBuf {
        self.addons_dir
            .clone()
            .unwrap_or_else(|| host_dir().join("addons"))
    }

    /// Returns true if the add-on is excluded from bulk start.
    #[must_use]
    pub fn is_disabled(&self, addon_id: &str) -> bool {
        self.disabled_addons.contains(addon_id)
    }

    /// Per-instance supervisor settings.
    #[must_use]
    pub fn instance_options(&self) -> InstanceOptions {
        InstanceOptions {
            restart_limit: self.restart_limit_per_minute,
            stderr_capacity: self.stderr_tail_capacity,
            invoke_timeout: Duration::from_millis(self.invoke_timeout_ms),
        }
    }

    /// Resolver using the configured managed-runtime launcher.
    #[must_use]
    pub fn resolver(&self) -> DescriptorResolver {
        DescriptorResolver::new(self.managed_runtime_launcher.clone())
    }
}
