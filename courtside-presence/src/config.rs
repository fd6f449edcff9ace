//! Configuration system for the Courtside presence server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/courtside-presence/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use crate::server::DEFAULT_MAX_SUBSCRIPTION;
use crate::tracker::{DEFAULT_TTL, TrackerConfig};

/// Errors that can occur when loading presence server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A timing value is unusable.
    #[error("invalid setting: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PresenceConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section of the presence config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    ttl_secs: Option<u64>,
    sweep_secs: Option<u64>,
    max_subscription: Option<usize>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the presence server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Courtside presence server")]
pub struct PresenceCliArgs {
    /// Address to bind the presence server to.
    #[arg(short, long, env = "PRESENCE_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/courtside-presence/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seconds of inactivity after which a user is offline.
    #[arg(long)]
    pub ttl_secs: Option<u64>,

    /// Seconds between expiry sweeps (default: a quarter of the TTL).
    #[arg(long)]
    pub sweep_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PRESENCE_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved presence server configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9100`).
    pub bind_addr: String,
    /// Tracker TTL and sweep interval.
    pub tracker: TrackerConfig,
    /// Maximum number of ids one connection may subscribe to.
    pub max_subscription: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9100".to_string(),
            tracker: TrackerConfig::default(),
            max_subscription: DEFAULT_MAX_SUBSCRIPTION,
            log_level: "info".to_string(),
        }
    }
}

impl PresenceConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if the TTL or sweep interval is zero.
    pub fn load(cli: &PresenceCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Priority: CLI > file > default. An unset sweep interval follows the
    /// resolved TTL.
    fn resolve(cli: &PresenceCliArgs, file: &PresenceConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let ttl = cli
            .ttl_secs
            .or(file.server.ttl_secs)
            .map_or(DEFAULT_TTL, Duration::from_secs);
        let mut tracker = TrackerConfig::with_ttl(ttl);
        if let Some(secs) = cli.sweep_secs.or(file.server.sweep_secs) {
            tracker.sweep_interval = Duration::from_secs(secs);
        }
        if tracker.ttl.is_zero() || tracker.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "ttl and sweep interval must be positive".to_string(),
            ));
        }

        Ok(Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            tracker,
            max_subscription: file
                .server
                .max_subscription
                .unwrap_or(defaults.max_subscription),
            log_level: cli.log_level.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<PresenceConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(PresenceConfigFile::default());
        };
        config_dir.join("courtside-presence").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PresenceConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
