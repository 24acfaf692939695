//! Logging setup for applications embedding the client
//!
//! The client logs through `tracing`. [`setup_logging`] installs a global
//! subscriber that shows this crate and the relay transport at the requested
//! level while keeping the WebSocket and WebRTC stacks at `warn`, which are
//! otherwise chatty at `debug`. A `RUST_LOG` variable replaces the computed
//! filter entirely.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{ClientError, ClientResult};

/// Crates whose output follows the configured level
const CALLWIRE_TARGETS: &[&str] = &["callwire_client_core", "callwire_signaling_transport", "callwire"];

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable lines on stderr
    #[default]
    Text,
    /// One JSON object per line on stdout, for log shippers
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for the callwire crates
    pub level: Level,
    /// Level for everything else
    pub dependency_level: Level,
    pub format: LogFormat,
    /// Include file and line of each event
    pub file_info: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            dependency_level: Level::WARN,
            format: LogFormat::Text,
            file_info: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Filter directives used when `RUST_LOG` is not set
    pub fn directives(&self) -> String {
        let mut directives = vec![level_name(self.dependency_level)];
        for target in CALLWIRE_TARGETS {
            directives.push(format!("{}={}", target, level_name(self.level)));
        }
        directives.join(",")
    }

    fn filter(&self) -> ClientResult<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(self.directives())
            .map_err(|e| ClientError::config(format!("Invalid log filter: {}", e)))
    }
}

fn level_name(level: Level) -> String {
    level.to_string().to_lowercase()
}

/// Install the global subscriber; an error, not a panic, if one exists
pub fn setup_logging(config: LoggingConfig) -> ClientResult<()> {
    let builder = fmt::Subscriber::builder()
        .with_env_filter(config.filter()?)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let result = match config.format {
        LogFormat::Json => builder.with_writer(std::io::stdout).json().try_init(),
        LogFormat::Text => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| ClientError::config(format!("Failed to install logger: {}", e)))?;

    tracing::debug!(filter = %config.directives(), format = ?config.format, "Logging initialised");
    Ok(())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> ClientResult<Level> {
    Level::from_str(level).map_err(|_| ClientError::config(format!("Invalid log level: {}", level)))
}
