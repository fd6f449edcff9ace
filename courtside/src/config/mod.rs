//! Configuration system for the Courtside client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/courtside/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use courtside_proto::message::UserId;

use crate::chat::send::DEFAULT_SEND_DEADLINE;
use crate::presence::interest::InterestConfig;

/// Errors that can occur when loading configuration.
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

    /// A setting has an unusable value.
    #[error("invalid setting: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    chat: ChatFileConfig,
    storage: StorageFileConfig,
    presence: PresenceFileConfig,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    send_deadline_secs: Option<u64>,
    event_buffer: Option<usize>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    dir: Option<PathBuf>,
}

/// `[presence]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PresenceFileConfig {
    server_url: Option<String>,
    user_id: Option<String>,
    debounce_ms: Option<u64>,
    low_priority_cap: Option<usize>,
    total_cap: Option<usize>,
    heartbeat_secs: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_secs: Option<u64>,
    reconnect_max_attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Backoff policy for the presence connection supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
    /// Give up after this many consecutive failures; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based): the initial delay
    /// doubled per attempt, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Chat --
    /// Deadline for one send attempt.
    pub send_deadline: Duration,
    /// Buffer size for the chat event channel.
    pub event_buffer: usize,

    // -- Storage --
    /// Directory holding the durable outbox.
    pub storage_dir: PathBuf,

    // -- Presence --
    /// Presence server WebSocket URL.
    pub server_url: Option<String>,
    /// Identity to connect as.
    pub user_id: Option<UserId>,
    /// Interest registry tuning.
    pub interest: InterestConfig,
    /// Interval between presence heartbeats.
    pub heartbeat: Duration,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            send_deadline: DEFAULT_SEND_DEADLINE,
            event_buffer: 64,
            storage_dir: default_storage_dir(),
            server_url: None,
            user_id: None,
            interest: InterestConfig::default(),
            heartbeat: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, if the default file exists but is malformed, or if the
    /// heartbeat interval or event buffer is zero.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let presence = &file.presence;

        let config = Self {
            send_deadline: file
                .chat
                .send_deadline_secs
                .map_or(defaults.send_deadline, Duration::from_secs),
            event_buffer: file.chat.event_buffer.unwrap_or(defaults.event_buffer),
            storage_dir: file
                .storage
                .dir
                .clone()
                .unwrap_or(defaults.storage_dir),
            server_url: cli
                .server_url
                .clone()
                .or_else(|| presence.server_url.clone()),
            user_id: cli
                .user_id
                .clone()
                .or_else(|| presence.user_id.clone())
                .map(UserId::new),
            interest: InterestConfig {
                debounce: presence
                    .debounce_ms
                    .map_or(defaults.interest.debounce, Duration::from_millis),
                low_priority_cap: presence
                    .low_priority_cap
                    .unwrap_or(defaults.interest.low_priority_cap),
                total_cap: presence.total_cap.unwrap_or(defaults.interest.total_cap),
            },
            heartbeat: presence
                .heartbeat_secs
                .map_or(defaults.heartbeat, Duration::from_secs),
            reconnect: ReconnectConfig {
                initial_delay: presence
                    .reconnect_initial_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                max_delay: presence
                    .reconnect_max_secs
                    .map_or(defaults.reconnect.max_delay, Duration::from_secs),
                max_attempts: presence
                    .reconnect_max_attempts
                    .or(defaults.reconnect.max_attempts),
            },
        };

        if config.heartbeat.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if config.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "event buffer must hold at least one event".to_string(),
            ));
        }
        Ok(config)
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Courtside presence watcher")]
pub struct CliArgs {
    /// WebSocket URL of the presence server.
    #[arg(long, env = "COURTSIDE_SERVER_URL")]
    pub server_url: Option<String>,

    /// User id to connect as.
    #[arg(long, env = "COURTSIDE_USER_ID")]
    pub user_id: Option<String>,

    /// User ids to watch (comma separated).
    #[arg(long, value_delimiter = ',')]
    pub watch: Vec<String>,

    /// Path to config file (default: `~/.config/courtside/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COURTSIDE_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/courtside.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_storage_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("courtside")
        .join("outbox")
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("courtside").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
