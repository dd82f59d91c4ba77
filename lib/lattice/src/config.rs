//! TOML configuration and the nodes file. The recognized options cover the
//! client and node binaries built on this crate; none of them is consulted
//! implicitly by the core types.

use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;

pub const DEFAULT_MAX_REQUESTS: u32 = 1024;
pub const DEFAULT_ERROR_WINDOW_SECS: u32 = 60;

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// Path to the nodes file, one `ip:port` per line.
    pub nodes_file: String,
    /// Path to the credentials file. Required for clients.
    pub credentials_file: Option<String>,
    /// Port a node listens on and a client connects to.
    pub neo_port: u16,
    /// Port of the legacy protocol. Not used by the core.
    pub legacy_port: Option<u16>,
    /// Upper bound on concurrently accepted connections. Absent means
    /// unbounded.
    pub connection_limit: Option<u32>,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Zero disables request deadlines.
    #[serde(default)]
    pub request_timeout_ms: u32,
    #[serde(default = "default_error_window")]
    pub error_window_s: u32,
}

fn default_max_requests() -> u32 {
    DEFAULT_MAX_REQUESTS
}

fn default_error_window() -> u32 {
    DEFAULT_ERROR_WINDOW_SECS
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serdeconv::Error),
    BadNodeAddress { line: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config file unreadable: {}", err),
            ConfigError::Parse(err) => write!(f, "config file malformed: {}", err),
            ConfigError::BadNodeAddress { line } => {
                write!(f, "nodes file holds an invalid address on line {}", line)
            }
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        serdeconv::from_toml_file(path).map_err(ConfigError::Parse)
    }

    pub fn legacy_port(&self) -> u16 {
        self.legacy_port.unwrap_or(self.neo_port - 1)
    }

    /// Loads and parses the configured nodes file.
    pub fn load_nodes(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        let text = fs::read_to_string(&self.nodes_file).map_err(ConfigError::Io)?;
        parse_nodes(&text)
    }
}

/// Parses a nodes file: UTF-8, one `ip:port` per line.
pub fn parse_nodes(text: &str) -> Result<Vec<SocketAddr>, ConfigError> {
    let mut nodes = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let addr = line
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::BadNodeAddress { line: index + 1 })?;
        nodes.push(addr);
    }

    Ok(nodes)
}
