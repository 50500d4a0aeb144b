//! Configuration for the proxy server
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/gatespy/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the proxy server to
    pub bind_addr: SocketAddr,

    /// Upstream API gateway base URL (origin-form targets join onto this)
    pub api_url: String,

    /// Directory for exchange log files
    pub log_dir: PathBuf,

    /// OAuth credentials for upstream authentication
    pub credentials: CredentialConfig,

    /// Tracing/log output configuration
    pub logging: LoggingConfig,

    /// Body and buffer caps
    pub limits: LimitsConfig,

    /// Upstream HTTP client tuning
    pub upstream: UpstreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().unwrap(),
            api_url: "https://api.anthropic.com".to_string(),
            log_dir: PathBuf::from("./logs"),
            credentials: CredentialConfig::default(),
            logging: LoggingConfig::default(),
            limits: LimitsConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// OAuth2 client-credentials settings for the token endpoint
#[derive(Debug, Clone, Default)]
pub struct CredentialConfig {
    pub token_url: String,
    pub client_id: String,
    /// Never written back to disk by `config --show`
    pub client_secret: String,
}

impl CredentialConfig {
    pub fn is_configured(&self) -> bool {
        !self.token_url.is_empty() && !self.client_id.is_empty()
    }
}

/// Log file rotation strategy
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LogRotation {
    /// Rotate log files hourly
    Hourly,
    /// Rotate log files daily (default)
    #[default]
    Daily,
    /// Never rotate - single log file
    Never,
}

impl LogRotation {
    /// Parse rotation string from config
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "hourly" => Self::Hourly,
            "daily" => Self::Daily,
            "never" => Self::Never,
            _ => Self::Daily, // Default to daily for unknown values
        }
    }

    /// Convert to string for TOML serialization
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Never => "never",
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Enable trace file logging (in addition to stderr)
    pub file_enabled: bool,
    /// Directory for trace log files
    pub file_dir: PathBuf,
    /// Log file rotation strategy
    pub file_rotation: LogRotation,
    /// Prefix for log file names (e.g., "gatespy" -> "gatespy.2024-01-15.log")
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: false, // Opt-in feature
            file_dir: PathBuf::from("./logs/trace"),
            file_rotation: LogRotation::Daily,
            file_prefix: "gatespy".to_string(),
        }
    }
}

/// Body and buffer caps
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Bytes of request/response body kept per exchange record
    pub max_logged_body: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_logged_body: 64 * 1024,
        }
    }
}

/// Upstream HTTP client tuning
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Overall per-request timeout, in seconds (streaming included)
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub api_url: Option<String>,
    pub log_dir: Option<String>,

    /// Optional [credentials] section
    pub credentials: Option<FileCredentials>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,

    /// Optional [limits] section
    pub limits: Option<FileLimits>,

    /// Optional [upstream] section
    pub upstream: Option<FileUpstream>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileCredentials {
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileLogging {
    pub level: Option<String>,
    pub file_enabled: Option<bool>,
    pub file_dir: Option<String>,
    pub file_rotation: Option<String>,
    pub file_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileLimits {
    pub max_logged_body: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileUpstream {
    pub timeout_secs: Option<u64>,
}

impl LoggingConfig {
    /// Create from file config with defaults
    fn from_file(file: Option<FileLogging>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            level: file.level.unwrap_or(defaults.level),
            file_enabled: file.file_enabled.unwrap_or(defaults.file_enabled),
            file_dir: file
                .file_dir
                .map(PathBuf::from)
                .unwrap_or(defaults.file_dir),
            file_rotation: file
                .file_rotation
                .map(|s| LogRotation::parse(&s))
                .unwrap_or(defaults.file_rotation),
            file_prefix: file.file_prefix.unwrap_or(defaults.file_prefix),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/gatespy/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("gatespy").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist
    /// Called during startup to help users discover configuration options
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };

        // Don't overwrite existing config
        if path.exists() {
            return;
        }

        // Create parent directory
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Silently fail - config is optional
            }
        }

        // Use Config::default().to_toml() as single source of truth
        let template = Self::default().to_toml();

        // Write config (ignore errors - config is optional)
        let _ = std::fs::write(&path, template);
    }

    /// Load file config if it exists
    ///
    /// A broken config fails fast with a clear error instead of silently
    /// falling back to defaults while the user debugs the wrong thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("\nCONFIG ERROR - Failed to parse configuration file\n");
                    eprintln!("  File: {}\n", path.display());
                    eprintln!("  Error: {}\n", e);
                    eprintln!("  To reset, run: gatespy config --reset\n");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Config file doesn't exist - use defaults
                FileConfig::default()
            }
            Err(e) => {
                eprintln!("\nCONFIG ERROR - Cannot read configuration file\n");
                eprintln!("  File: {}\n", path.display());
                eprintln!("  Error: {}\n", e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env vars -> file -> defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        let defaults = Self::default();

        // Bind address: env > file > default
        let bind_addr = std::env::var("GATESPY_BIND")
            .ok()
            .or(file.bind_addr)
            .map(|s| s.parse().unwrap_or_else(|_| {
                eprintln!("Invalid bind address: {}", s);
                std::process::exit(1);
            }))
            .unwrap_or(defaults.bind_addr);

        // API URL: env > file > default
        let api_url = std::env::var("GATESPY_API_URL")
            .ok()
            .or(file.api_url)
            .unwrap_or(defaults.api_url);

        // Log directory: env > file > default
        let log_dir = std::env::var("GATESPY_LOG_DIR")
            .ok()
            .or(file.log_dir)
            .map(PathBuf::from)
            .unwrap_or(defaults.log_dir);

        // Credentials: each field env > file. The secret in particular is
        // expected to come from the environment in most deployments.
        let file_creds = file.credentials.unwrap_or_default();
        let credentials = CredentialConfig {
            token_url: std::env::var("GATESPY_TOKEN_URL")
                .ok()
                .or(file_creds.token_url)
                .unwrap_or_default(),
            client_id: std::env::var("GATESPY_CLIENT_ID")
                .ok()
                .or(file_creds.client_id)
                .unwrap_or_default(),
            client_secret: std::env::var("GATESPY_CLIENT_SECRET")
                .ok()
                .or(file_creds.client_secret)
                .unwrap_or_default(),
        };

        let logging = LoggingConfig::from_file(file.logging);

        let limits = LimitsConfig {
            max_logged_body: file
                .limits
                .and_then(|l| l.max_logged_body)
                .unwrap_or(defaults.limits.max_logged_body),
        };

        let upstream = UpstreamConfig {
            timeout_secs: file
                .upstream
                .and_then(|u| u.timeout_secs)
                .unwrap_or(defaults.upstream.timeout_secs),
        };

        Self {
            bind_addr,
            api_url,
            log_dir,
            credentials,
            logging,
            limits,
            upstream,
        }
    }

    /// Serialize to TOML for the config file template and `config --show`.
    /// The client secret is never written; only its presence is noted.
    pub fn to_toml(&self) -> String {
        format!(
            r#"# gatespy configuration
# Precedence: environment variables > this file > defaults

bind_addr = "{bind_addr}"
api_url = "{api_url}"
log_dir = "{log_dir}"

[credentials]
token_url = "{token_url}"
client_id = "{client_id}"
# client_secret: set via GATESPY_CLIENT_SECRET {secret_note}

[logging]
level = "{level}"
file_enabled = {file_enabled}
file_dir = "{file_dir}"
file_rotation = "{file_rotation}"
file_prefix = "{file_prefix}"

[limits]
max_logged_body = {max_logged_body}

[upstream]
timeout_secs = {timeout_secs}
"#,
            bind_addr = self.bind_addr,
            api_url = self.api_url,
            log_dir = self.log_dir.display(),
            token_url = self.credentials.token_url,
            client_id = self.credentials.client_id,
            secret_note = if self.credentials.client_secret.is_empty() {
                "(not set)"
            } else {
                "(set)"
            },
            level = self.logging.level,
            file_enabled = self.logging.file_enabled,
            file_dir = self.logging.file_dir.display(),
            file_rotation = self.logging.file_rotation.as_str(),
            file_prefix = self.logging.file_prefix,
            max_logged_body = self.limits.max_logged_body,
            timeout_secs = self.upstream.timeout_secs,
        )
    }
}
