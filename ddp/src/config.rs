use crate::env::{EnvStore, MASTER_ADDR, MASTER_PORT};
use crate::errors::{DdpError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default rendezvous address when neither the environment nor the
/// arguments provide one.
pub const DEFAULT_MASTER_ADDRESS: &str = "127.0.0.1";
/// Default rendezvous port.
pub const DEFAULT_MASTER_PORT: u16 = 29500;
/// Default bound on rendezvous and on every collective.
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;

/// Launch arguments handed to every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchArgs {
    /// Fallback for `MASTER_ADDR`
    pub master_address: String,
    /// Fallback for `MASTER_PORT`
    pub master_port: u16,
    /// Device index of this worker on its node
    pub local_rank: Option<usize>,
    /// Worker processes per node; `<= 1` disables the process group
    pub num_process_per_node: usize,
    /// Rendezvous and collective timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LaunchArgs {
    fn default() -> Self {
        Self {
            master_address: DEFAULT_MASTER_ADDRESS.to_string(),
            master_port: DEFAULT_MASTER_PORT,
            local_rank: None,
            num_process_per_node: 1,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl LaunchArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.master_address.trim().is_empty() {
            return Err(DdpError::Config("master_address must not be empty".into()));
        }

        if self.num_process_per_node == 0 {
            return Err(DdpError::Config(
                "num_process_per_node must be at least 1".into(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(DdpError::Config("timeout_secs must be at least 1".into()));
        }

        Ok(())
    }
}

/// Where and how long to rendezvous, as resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    pub master_addr: String,
    pub master_port: u16,
    pub timeout: Duration,
}

impl Rendezvous {
    /// Default `MASTER_ADDR`/`MASTER_PORT` from `args`, then read them back.
    ///
    /// Values already present in the environment win over the arguments.
    pub fn from_env(env: &dyn EnvStore, args: &LaunchArgs) -> Result<Self> {
        let master_addr = env.set_default(MASTER_ADDR, &args.master_address);
        let port = env.set_default(MASTER_PORT, &args.master_port.to_string());

        if master_addr.trim().is_empty() {
            return Err(DdpError::Config(format!("{MASTER_ADDR} is empty")));
        }

        let master_port = port.trim().parse::<u16>().map_err(|e| {
            DdpError::Config(format!("{MASTER_PORT}={port:?} is not a valid port: {e}"))
        })?;

        Ok(Self {
            master_addr,
            master_port,
            timeout: args.timeout(),
        })
    }

    /// `host:port` form used to connect to rank 0.
    pub fn endpoint(&self) -> String {
        if self.master_addr.contains(':') && !self.master_addr.starts_with('[') {
            format!("[{}]:{}", self.master_addr, self.master_port)
        } else {
            format!("{}:{}", self.master_addr, self.master_port)
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    /// When set, every rank also writes `rank-<n>.log` here
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            log_dir: None,
        }
    }
}

/// Configuration file for `ddp-launch`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default)]
    pub launch: LaunchArgs,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LauncherConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: LauncherConfig = toml::from_str(&content)?;

        config.validate()?;

        tracing::debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.launch.validate()?;

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(DdpError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            _ => {
                return Err(DdpError::Config(
                    "log format must be 'pretty' or 'json'".into(),
                ))
            }
        }

        Ok(())
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create config directory"
                );
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        // Write to a temp file, then rename over the target
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp config file"
            );
            e
        })?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        Ok(())
    }
}
