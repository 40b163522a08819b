//! Configuration module for dial-harness.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the harness
#[derive(Parser, Debug)]
#[command(name = "dial-harness")]
#[command(author = "dial-harness authors")]
#[command(version = "0.1.0")]
#[command(about = "Exercises a TCP listener/dialer lifecycle", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind the listener to (port 0 = ephemeral)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Bytes the client writes before closing
    #[arg(short = 'p', long)]
    pub payload: Option<String>,

    /// Read buffer size for each connection handler
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Deadline for each blocking step, in milliseconds
    #[arg(short = 't', long)]
    pub timeout_ms: Option<u64>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub harness: HarnessConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scenario-related configuration
#[derive(Debug, Deserialize)]
pub struct HarnessConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Bytes the client writes before closing
    pub payload: Option<String>,
    /// Read buffer size for each connection handler
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Deadline for each blocking step, in milliseconds
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    /// Number of runtime worker threads
    pub workers: Option<usize>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            payload: None,
            buffer_size: default_buffer_size(),
            step_timeout_ms: default_step_timeout_ms(),
            workers: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:0".to_string()
}

fn default_buffer_size() -> usize {
    crate::handler::DEFAULT_BUFFER_SIZE
}

fn default_step_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub payload: Option<String>,
    pub buffer_size: usize,
    pub step_timeout_ms: u64,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.harness.listen),
            payload: cli.payload.or(toml_config.harness.payload),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.harness.buffer_size),
            step_timeout_ms: cli
                .timeout_ms
                .unwrap_or(toml_config.harness.step_timeout_ms),
            workers: cli.workers.or(toml_config.harness.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        if config.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        if config.workers == Some(0) {
            return Err(ConfigError::InvalidWorkers);
        }

        Ok(config)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidBufferSize,
    InvalidWorkers,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidBufferSize => write!(f, "Buffer size must be at least 1 byte"),
            ConfigError::InvalidWorkers => write!(f, "Worker count must be at least 1"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.harness.listen, "127.0.0.1:0");
        assert_eq!(config.harness.buffer_size, 1024);
        assert_eq!(config.harness.step_timeout_ms, 5_000);
        assert!(config.harness.payload.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [harness]
            listen = "127.0.0.1:9000"
            payload = "ping"
            buffer_size = 64
            step_timeout_ms = 250
            workers = 2

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.harness.listen, "127.0.0.1:9000");
        assert_eq!(config.harness.payload.as_deref(), Some("ping"));
        assert_eq!(config.harness.buffer_size, 64);
        assert_eq!(config.harness.step_timeout_ms, 250);
        assert_eq!(config.harness.workers, Some(2));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_defaults() {
        let cli = CliArgs::try_parse_from(["dial-harness"]).unwrap();
        let config = Config::from_args(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:0");
        assert_eq!(config.buffer_size, 1024);
        assert!(config.payload.is_none());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliArgs::try_parse_from([
            "dial-harness",
            "--listen",
            "127.0.0.1:7000",
            "--payload",
            "hello",
            "-b",
            "16",
            "--timeout-ms",
            "100",
            "--log-level",
            "trace",
        ])
        .unwrap();
        let config = Config::from_args(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.payload.as_deref(), Some("hello"));
        assert_eq!(config.buffer_size, 16);
        assert_eq!(config.step_timeout_ms, 100);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let cli = CliArgs::try_parse_from(["dial-harness", "--buffer-size", "0"]).unwrap();
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::InvalidBufferSize)
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let cli = CliArgs::try_parse_from(["dial-harness", "--workers", "0"]).unwrap();
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::InvalidWorkers)
        ));
    }

    #[test]
    fn test_missing_config_file() {
        let cli =
            CliArgs::try_parse_from(["dial-harness", "-c", "/nonexistent/harness.toml"]).unwrap();
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::FileRead(..))
        ));
    }
}
