//! Configuration for the device agent.
//!
//! Settings come from command-line flags, each of which can also be set
//! through a `DEVICEPLANE_*` environment variable. [`Cli`] holds the raw
//! values; [`Config::from_cli`] validates them.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use deviceplane_id::{IdError, ProjectId};
use thiserror::Error;

use crate::info::OS_RELEASE_PATH;
use crate::reconciler::ReconcilerConfig;
use crate::tunnel::BackoffPolicy;

/// Default controller API endpoint.
pub const DEFAULT_CONTROLLER_URL: &str = "https://cloud.deviceplane.com:443/api";

/// Errors from configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid controller URL '{url}': {reason}")]
    InvalidControllerUrl { url: String, reason: String },

    #[error("invalid log level '{0}' (expected trace, debug, info, warn, error or fatal)")]
    InvalidLogLevel(String),

    #[error("invalid project: {0}")]
    InvalidProject(#[source] IdError),
}

/// deviceplane agent - registers the device and keeps the controller's view
/// of it consistent.
#[derive(Debug, Parser)]
#[command(name = "deviceplane-agent")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Controller API URL.
    #[arg(long, env = "DEVICEPLANE_CONTROLLER", default_value = DEFAULT_CONTROLLER_URL)]
    pub controller: String,

    /// Project ID the device belongs to.
    #[arg(long, env = "DEVICEPLANE_PROJECT")]
    pub project: String,

    /// Registration token, required the first time the agent starts.
    #[arg(long, env = "DEVICEPLANE_REGISTRATION_TOKEN", hide_env_values = true)]
    pub registration_token: Option<String>,

    /// Configuration directory, created if missing.
    #[arg(long, env = "DEVICEPLANE_CONF_DIR", default_value = "/etc/deviceplane")]
    pub conf_dir: PathBuf,

    /// State directory holding the device identity.
    #[arg(long, env = "DEVICEPLANE_STATE_DIR", default_value = "/var/lib/deviceplane")]
    pub state_dir: PathBuf,

    /// Port of the local admin server.
    #[arg(long, env = "DEVICEPLANE_SERVER_PORT", default_value_t = 4444)]
    pub server_port: u16,

    /// Log level (trace, debug, info, warn, error, fatal).
    #[arg(long, env = "DEVICEPLANE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "DEVICEPLANE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Log verbosity. `fatal` is accepted and treated as `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive for `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "fatal" => Ok(LogLevel::Error),
            _ => Err(ConfigError::InvalidLogLevel(s.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Registration token. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistrationToken(String);

impl RegistrationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RegistrationToken(<redacted>)")
    }
}

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Controller API URL, without a trailing slash.
    pub controller_url: String,

    pub project: ProjectId,

    pub registration_token: Option<RegistrationToken>,

    pub conf_dir: PathBuf,

    pub state_dir: PathBuf,

    pub server_port: u16,

    pub log_level: LogLevel,

    pub log_format: LogFormat,

    /// Interval between registration attempts.
    pub registration_retry_interval: Duration,

    /// Interval between bundle fetches.
    pub bundle_poll_interval: Duration,

    /// Interval between device info checks.
    pub info_interval: Duration,

    pub os_release_path: PathBuf,

    pub reconciler: ReconcilerConfig,

    pub tunnel_backoff: BackoffPolicy,

    /// How long `stop` waits for tasks before aborting them.
    pub stop_grace: Duration,
}

impl Config {
    /// Validate parsed command-line flags.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let controller_url = validate_controller_url(&cli.controller)?;
        let project = ProjectId::parse(cli.project).map_err(ConfigError::InvalidProject)?;
        let log_level = cli.log_level.parse()?;

        let mut config = Self::new(controller_url, project);
        config.registration_token = cli
            .registration_token
            .filter(|token| !token.trim().is_empty())
            .map(RegistrationToken::new);
        config.conf_dir = cli.conf_dir;
        config.state_dir = cli.state_dir;
        config.server_port = cli.server_port;
        config.log_level = log_level;
        config.log_format = cli.log_format;
        Ok(config)
    }

    /// Configuration with default intervals and paths.
    pub fn new(controller_url: impl Into<String>, project: ProjectId) -> Self {
        let controller_url: String = controller_url.into();
        Self {
            controller_url: controller_url.trim_end_matches('/').to_string(),
            project,
            registration_token: None,
            conf_dir: PathBuf::from("/etc/deviceplane"),
            state_dir: PathBuf::from("/var/lib/deviceplane"),
            server_port: 4444,
            log_level: LogLevel::Info,
            log_format: LogFormat::Json,
            registration_retry_interval: Duration::from_secs(5),
            bundle_poll_interval: Duration::from_secs(10),
            info_interval: Duration::from_secs(60),
            os_release_path: PathBuf::from(OS_RELEASE_PATH),
            reconciler: ReconcilerConfig::default(),
            tunnel_backoff: BackoffPolicy::default(),
            stop_grace: Duration::from_secs(70),
        }
    }
}

fn validate_controller_url(raw: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidControllerUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = reqwest::Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("query and fragment are not allowed"));
    }

    Ok(raw.trim_end_matches('/').to_string())
}
