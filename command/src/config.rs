//! # relais configuration
//!
//! A TOML file deserializes into a [`FileConfig`] where every key is optional.
//! [`FileConfig::into_config`] fills in the defaults below and validates the
//! values, producing the [`Config`] the engine and the binary work with.
//!
//! ```toml
//! listen_address = "0.0.0.0:3129"
//! keep_alive_timeout = 30
//! tunnel_timeout = 600
//! log_level = "debug"
//! log_target = "file:///var/log/relais.log"
//! ```
use std::{
    fmt,
    fs::File,
    io::{self, Read},
    net::SocketAddr,
    path::Path,
    time::Duration,
};

use serde::Deserialize;

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:3129";

/// idle window, in seconds, for the endpoint expected to send the next bytes
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: u64 = 30;

/// idle window, in seconds, for both sides of a CONNECT tunnel
pub const DEFAULT_TUNNEL_TIMEOUT: u64 = 600;

/// number of bytes read from a socket at once
pub const DEFAULT_BUFFER_SIZE: usize = 16_384;

/// chunks queued on an endpoint before producers block
pub const DEFAULT_MAX_OUTBOUND_CHUNKS: usize = 3000;

pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const DEFAULT_LOG_TARGET: &str = "stdout";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not open file {path_to_open}: {io_error}")]
    FileOpen {
        path_to_open: String,
        io_error: io::Error,
    },
    #[error("could not read file {path_to_read}: {io_error}")]
    FileRead {
        path_to_read: String,
        io_error: io::Error,
    },
    #[error("could not deserialize the configuration: {0}")]
    Deserialize(toml::de::Error),
    #[error("invalid listen address {address}: {error}")]
    InvalidAddress {
        address: String,
        error: std::net::AddrParseError,
    },
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: &'static str, message: String },
}

/// Configuration as written in the TOML file
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen_address: Option<String>,
    pub keep_alive_timeout: Option<u64>,
    pub tunnel_timeout: Option<u64>,
    pub buffer_size: Option<usize>,
    pub max_outbound_chunks: Option<usize>,
    pub max_connections: Option<usize>,
    pub log_level: Option<String>,
    pub log_target: Option<String>,
}

impl FileConfig {
    pub fn load_from_path(path: &str) -> Result<FileConfig, ConfigError> {
        let data = Self::read_file(path)?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<FileConfig, ConfigError> {
        toml::from_str(data).map_err(ConfigError::Deserialize)
    }

    fn read_file(path: &str) -> Result<String, ConfigError> {
        let mut file = File::open(Path::new(path)).map_err(|io_error| ConfigError::FileOpen {
            path_to_open: path.to_owned(),
            io_error,
        })?;

        let mut data = String::new();
        file.read_to_string(&mut data)
            .map_err(|io_error| ConfigError::FileRead {
                path_to_read: path.to_owned(),
                io_error,
            })?;
        Ok(data)
    }

    pub fn into_config(self) -> Result<Config, ConfigError> {
        let address = self
            .listen_address
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_owned());
        let listen_address = address
            .parse::<SocketAddr>()
            .map_err(|error| ConfigError::InvalidAddress {
                address: address.clone(),
                error,
            })?;

        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        if buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "buffer_size",
                message: "must be greater than 0".to_owned(),
            });
        }

        let max_outbound_chunks = self
            .max_outbound_chunks
            .unwrap_or(DEFAULT_MAX_OUTBOUND_CHUNKS);
        if max_outbound_chunks == 0 {
            return Err(ConfigError::InvalidValue {
                name: "max_outbound_chunks",
                message: "must be greater than 0".to_owned(),
            });
        }

        Ok(Config {
            listen_address,
            keep_alive_timeout: Duration::from_secs(
                self.keep_alive_timeout
                    .unwrap_or(DEFAULT_KEEP_ALIVE_TIMEOUT),
            ),
            tunnel_timeout: Duration::from_secs(
                self.tunnel_timeout.unwrap_or(DEFAULT_TUNNEL_TIMEOUT),
            ),
            buffer_size,
            max_outbound_chunks,
            max_connections: self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            log_level: self
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned()),
            log_target: self
                .log_target
                .unwrap_or_else(|| DEFAULT_LOG_TARGET.to_owned()),
        })
    }
}

/// Resolved configuration. A zero timeout disables that idle deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen_address: SocketAddr,
    pub keep_alive_timeout: Duration,
    pub tunnel_timeout: Duration,
    pub buffer_size: usize,
    pub max_outbound_chunks: usize,
    pub max_connections: usize,
    pub log_level: String,
    pub log_target: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_address: SocketAddr::from(([127, 0, 0, 1], 3129)),
            keep_alive_timeout: Duration::from_secs(DEFAULT_KEEP_ALIVE_TIMEOUT),
            tunnel_timeout: Duration::from_secs(DEFAULT_TUNNEL_TIMEOUT),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_outbound_chunks: DEFAULT_MAX_OUTBOUND_CHUNKS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            log_level: DEFAULT_LOG_LEVEL.to_owned(),
            log_target: DEFAULT_LOG_TARGET.to_owned(),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "listen_address = \"{}\"", self.listen_address)?;
        writeln!(
            f,
            "keep_alive_timeout = {}",
            self.keep_alive_timeout.as_secs()
        )?;
        writeln!(f, "tunnel_timeout = {}", self.tunnel_timeout.as_secs())?;
        writeln!(f, "buffer_size = {}", self.buffer_size)?;
        writeln!(f, "max_outbound_chunks = {}", self.max_outbound_chunks)?;
        writeln!(f, "max_connections = {}", self.max_connections)?;
        writeln!(f, "log_level = \"{}\"", self.log_level)?;
        write!(f, "log_target = \"{}\"", self.log_target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config = FileConfig::from_toml_str("")
            .and_then(FileConfig::into_config)
            .expect("empty configuration should be valid");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn overrides() {
        let config = FileConfig::from_toml_str(
            r#"
            listen_address = "0.0.0.0:8080"
            keep_alive_timeout = 5
            tunnel_timeout = 0
            max_connections = 12
            log_level = "debug"
            "#,
        )
        .and_then(FileConfig::into_config)
        .expect("configuration should be valid");

        assert_eq!(config.listen_address, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.keep_alive_timeout, Duration::from_secs(5));
        assert_eq!(config.tunnel_timeout, Duration::ZERO);
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            FileConfig::from_toml_str("cluster_id = \"app\""),
            Err(ConfigError::Deserialize(_))
        ));
    }

    #[test]
    fn invalid_values() {
        let file_config = FileConfig {
            listen_address: Some("localhost".to_owned()),
            ..Default::default()
        };
        assert!(matches!(
            file_config.into_config(),
            Err(ConfigError::InvalidAddress { .. })
        ));

        let file_config = FileConfig {
            max_outbound_chunks: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            file_config.into_config(),
            Err(ConfigError::InvalidValue {
                name: "max_outbound_chunks",
                ..
            })
        ));
    }

    #[test]
    fn load_from_path() {
        let mut file = tempfile::NamedTempFile::new().expect("could not create temporary file");
        writeln!(file, "buffer_size = 4096").expect("could not write configuration");

        let path = file.path().to_str().expect("temporary path is not UTF-8");
        let config = FileConfig::load_from_path(path)
            .and_then(FileConfig::into_config)
            .expect("could not load configuration");
        assert_eq!(config.buffer_size, 4096);

        assert!(matches!(
            FileConfig::load_from_path("/nonexistent/relais.toml"),
            Err(ConfigError::FileOpen { .. })
        ));
    }

    #[test]
    fn display_round_trips() {
        let config = Config::default();
        let parsed = FileConfig::from_toml_str(&config.to_string())
            .and_then(FileConfig::into_config)
            .expect("displayed configuration should parse");
        assert_eq!(parsed, config);
    }
}
