//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl ServerConfig {
    /// `host:port` string for binding
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Protocol and broadcast limits
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_max_handshake_bytes")]
    pub max_handshake_bytes: usize,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u64,

    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_dispatch_queue_capacity")]
    pub dispatch_queue_capacity: usize,

    #[serde(default = "default_strict_reserved_bits")]
    pub strict_reserved_bits: bool,

    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,
}

fn default_max_connections() -> usize {
    1024
}

fn default_handshake_timeout() -> u64 {
    5000 // 5 seconds
}

fn default_max_handshake_bytes() -> usize {
    8 * 1024
}

fn default_max_frame_bytes() -> u64 {
    16 * 1024 * 1024 // 16 MiB
}

fn default_max_message_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_dispatch_queue_capacity() -> usize {
    256
}

fn default_strict_reserved_bits() -> bool {
    true
}

fn default_read_buffer_bytes() -> usize {
    4096
}

impl RelayConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            handshake_timeout_ms: default_handshake_timeout(),
            max_handshake_bytes: default_max_handshake_bytes(),
            max_frame_bytes: default_max_frame_bytes(),
            max_message_bytes: default_max_message_bytes(),
            write_timeout_ms: default_write_timeout(),
            dispatch_queue_capacity: default_dispatch_queue_capacity(),
            strict_reserved_bits: default_strict_reserved_bits(),
            read_buffer_bytes: default_read_buffer_bytes(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("wsrelay").join("config.toml")),
            Some(PathBuf::from("/etc/wsrelay/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Server overrides
        if let Some(host) = lookup("WSRELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("WSRELAY_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }

        // Relay overrides
        if let Some(max) = lookup("WSRELAY_MAX_CONNECTIONS") {
            if let Ok(m) = max.parse() {
                self.relay.max_connections = m;
            }
        }

        // Logging overrides
        if let Some(level) = lookup("WSRELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("WSRELAY_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# wsrelay Configuration
#
# Environment variables override these settings:
# - WSRELAY_HOST
# - WSRELAY_PORT
# - WSRELAY_MAX_CONNECTIONS
# - WSRELAY_LOG_LEVEL
# - WSRELAY_LOG_FORMAT

[server]
# Address to listen on
host = "127.0.0.1"

# Port to listen on
port = 8080

[relay]
# Maximum number of simultaneously open connections
max_connections = 1024

# How long a client may take to send its upgrade request (ms)
handshake_timeout_ms = 5000

# Largest accepted upgrade request head (bytes)
max_handshake_bytes = 8192

# Largest accepted single frame payload (bytes)
max_frame_bytes = 16777216

# Largest accepted reassembled message (bytes)
max_message_bytes = 16777216

# Peers that cannot take a broadcast within this time are dropped (ms)
write_timeout_ms = 10000

# Messages that may wait for the dispatcher
dispatch_queue_capacity = 256

# Reject frames with RSV bits set
strict_reserved_bits = true

# Socket read size (bytes)
read_buffer_bytes = 4096

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind_addr(), "127.0.0.1:8080");
        assert_eq!(config.relay.max_connections, 1024);
        assert_eq!(config.relay.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.relay.write_timeout(), Duration::from_secs(10));
        assert!(config.relay.strict_reserved_bits);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_generated_config_parses_to_defaults() {
        let config = Config::parse(&generate_default_config()).unwrap();
        let defaults = Config::default();

        assert_eq!(config.server.host, defaults.server.host);
        assert_eq!(config.server.port, defaults.server.port);
        assert_eq!(config.relay.max_frame_bytes, defaults.relay.max_frame_bytes);
        assert_eq!(
            config.relay.dispatch_queue_capacity,
            defaults.relay.dispatch_queue_capacity
        );
        assert_eq!(config.logging.format, defaults.logging.format);
    }

    #[test]
    fn test_partial_config() {
        let toml = "[server]\nport = 9001\n\n[relay]\nmax_connections = 4\n";
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.relay.max_connections, 4);
        assert_eq!(config.relay.write_timeout_ms, 10_000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nformat = \"json\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_load_errors() {
        let missing = Config::load(Path::new("/nonexistent/wsrelay.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = \"not a number\"").unwrap();
        let invalid = Config::load(file.path());
        assert!(matches!(invalid, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("WSRELAY_HOST", "0.0.0.0"),
            ("WSRELAY_PORT", "9999"),
            ("WSRELAY_MAX_CONNECTIONS", "not-a-number"),
            ("WSRELAY_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.server.bind_addr(), "0.0.0.0:9999");
        assert_eq!(config.relay.max_connections, 1024);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
    }
}
