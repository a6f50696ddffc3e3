//! Server configuration module.
//!
//! # Pre-conditions
//! - Environment variables must be valid UTF-8 if set.
//!
//! # Post-conditions
//! - `ServerConfig` contains valid configuration values.
//! - `listen_port` defaults to 5001 if not specified.
//! - `log_directory` defaults to "./logs" if not specified.
//!
//! # Invariants
//! - `log_directory` is a valid path.
//! - `lease_duration` and `max_message_size` are positive.

use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables.
///
/// # Environment Variables
/// - `REPLOG_LOG_DIRECTORY`: Optional. Path to the log file directory. Defaults to "./logs".
/// - `REPLOG_LISTEN_PORT`: Optional. Port the feeder listens on. Defaults to 5001.
/// - `REPLOG_LEASE_DURATION_MS`: Optional. Backup lease duration after a
///   client disconnect, in milliseconds. Defaults to 60000.
/// - `REPLOG_MAX_MESSAGE_SIZE`: Optional. Cap on a protocol message body in
///   bytes. Defaults to 8388608 (8 MiB).
#[derive(Debug)]
pub struct ServerConfig {
    /// Directory holding the numbered log files.
    pub log_directory: PathBuf,
    /// Port the feeder listens on.
    pub listen_port: u16,
    /// Backup lease duration after a client disconnect.
    pub lease_duration: Duration,
    /// Cap on a single protocol message body.
    pub max_message_size: usize,
}

/// Error returned when configuration loading fails.
#[derive(Debug)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue {
        /// Name of the environment variable.
        name: &'static str,
        /// The invalid value that was provided.
        value: String,
        /// Description of why the value is invalid.
        reason: &'static str,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue {
                name,
                value,
                reason,
            } => {
                write!(
                    f,
                    "invalid value for environment variable {name}='{value}': {reason}"
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl ServerConfig {
    /// Default port if `REPLOG_LISTEN_PORT` is not set.
    const DEFAULT_PORT: u16 = 5001;
    /// Default log directory if `REPLOG_LOG_DIRECTORY` is not set.
    const DEFAULT_LOG_DIRECTORY: &'static str = "./logs";
    /// Default lease duration in milliseconds.
    const DEFAULT_LEASE_DURATION_MS: u64 = 60_000;
    /// Default message body cap.
    const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidValue` when a numeric variable does not
    /// parse or is zero where zero makes no sense.
    pub fn from_env() -> Result<Self, ConfigError> {
        let log_directory = std::env::var("REPLOG_LOG_DIRECTORY").map_or_else(
            |_| PathBuf::from(Self::DEFAULT_LOG_DIRECTORY),
            PathBuf::from,
        );

        let listen_port = match std::env::var("REPLOG_LISTEN_PORT") {
            Ok(port_str) => port_str
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: "REPLOG_LISTEN_PORT",
                    value: port_str,
                    reason: "must be a valid port number (0-65535)",
                })?,
            Err(_) => Self::DEFAULT_PORT,
        };

        let lease_ms = match std::env::var("REPLOG_LEASE_DURATION_MS") {
            Ok(ms_str) => match ms_str.parse::<u64>() {
                Ok(ms) if ms > 0 => ms,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "REPLOG_LEASE_DURATION_MS",
                        value: ms_str,
                        reason: "must be a positive number of milliseconds",
                    });
                }
            },
            Err(_) => Self::DEFAULT_LEASE_DURATION_MS,
        };

        let max_message_size = match std::env::var("REPLOG_MAX_MESSAGE_SIZE") {
            Ok(size_str) => match size_str.parse::<usize>() {
                Ok(size) if size > 0 => size,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "REPLOG_MAX_MESSAGE_SIZE",
                        value: size_str,
                        reason: "must be a positive number of bytes",
                    });
                }
            },
            Err(_) => Self::DEFAULT_MAX_MESSAGE_SIZE,
        };

        Ok(Self {
            log_directory,
            listen_port,
            lease_duration: Duration::from_millis(lease_ms),
            max_message_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment-variable tests mutate process state, so each one uses a
    // distinct variable and restores it afterwards.

    #[test]
    fn test_defaults() {
        let config = ServerConfig {
            log_directory: PathBuf::from(ServerConfig::DEFAULT_LOG_DIRECTORY),
            listen_port: ServerConfig::DEFAULT_PORT,
            lease_duration: Duration::from_millis(ServerConfig::DEFAULT_LEASE_DURATION_MS),
            max_message_size: ServerConfig::DEFAULT_MAX_MESSAGE_SIZE,
        };
        assert_eq!(config.listen_port, 5001);
        assert_eq!(config.lease_duration, Duration::from_secs(60));
        assert_eq!(config.max_message_size, 8 * 1024 * 1024);
    }
}
