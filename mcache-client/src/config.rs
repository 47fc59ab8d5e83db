//! # Client Configuration
//!
//! Purpose: Describe the server list, timeouts, and buffering mode a client
//! starts with, and parse the textual server list format.
//!
//! ## Design Principles
//! 1. **Explicit Fields**: Timeouts live in a plain `Timeouts` value that the
//!    client reads at the start of each operation; nothing mutates live state
//!    behind the caller's back.
//! 2. **Serde-Friendly**: `ClientConfig` loads from JSON with per-field defaults.
//! 3. **Validate Early**: Malformed lists and zero timeouts are `Config` errors
//!    before any socket exists.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Port used when a server entry omits one.
pub const DEFAULT_PORT: u16 = 11211;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_RECONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_DEAD_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_IO_TIMEOUT_MS: u64 = 1_000;

/// Timeouts consulted by every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Maximum time for a TCP connect to complete.
    pub connect: Duration,
    /// Minimum spacing between connection attempts to the same server.
    pub reconnect: Duration,
    /// Minimum time a server stays excluded after a failure.
    pub dead: Duration,
    /// Default per-call deadline when a call passes no timeout.
    pub io: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            reconnect: Duration::from_millis(DEFAULT_RECONNECT_TIMEOUT_MS),
            dead: Duration::from_millis(DEFAULT_DEAD_TIMEOUT_MS),
            io: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
        }
    }
}

impl Timeouts {
    /// Rejects values that would make every connect or call fail instantly.
    pub fn validate(&self) -> ClientResult<()> {
        if self.connect.is_zero() {
            return Err(ClientError::config("connect timeout must be positive"));
        }
        if self.io.is_zero() {
            return Err(ClientError::config("io timeout must be positive"));
        }
        Ok(())
    }
}

/// Serializable client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Server entries, e.g. `["10.0.0.1:11211", "cache-b"]`.
    pub servers: Vec<String>,
    pub connect_timeout_ms: u64,
    pub reconnect_timeout_ms: u64,
    pub dead_timeout_ms: u64,
    pub io_timeout_ms: u64,
    /// Start with request buffering enabled.
    pub buffering: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            servers: vec![format!("127.0.0.1:{}", DEFAULT_PORT)],
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            reconnect_timeout_ms: DEFAULT_RECONNECT_TIMEOUT_MS,
            dead_timeout_ms: DEFAULT_DEAD_TIMEOUT_MS,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            buffering: false,
        }
    }
}

impl ClientConfig {
    /// Builds a default configuration for a comma-joined server list.
    pub fn with_servers(list: &str) -> ClientResult<Self> {
        let servers = parse_server_list(list)?
            .into_iter()
            .map(|addr| addr.to_string())
            .collect();
        Ok(ClientConfig {
            servers,
            ..ClientConfig::default()
        })
    }

    /// Parses a JSON document; absent fields keep their defaults.
    pub fn from_json_str(raw: &str) -> ClientResult<Self> {
        let config: ClientConfig =
            serde_json::from_str(raw).map_err(|err| ClientError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            reconnect: Duration::from_millis(self.reconnect_timeout_ms),
            dead: Duration::from_millis(self.dead_timeout_ms),
            io: Duration::from_millis(self.io_timeout_ms),
        }
    }

    pub fn server_addrs(&self) -> ClientResult<Vec<ServerAddr>> {
        self.servers.as_slice().into_server_list()
    }

    pub fn validate(&self) -> ClientResult<()> {
        self.timeouts().validate()?;
        self.server_addrs().map(|_| ())
    }
}

/// One `host:port` entry of the server list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerAddr {
            host: host.into(),
            port,
        }
    }

    /// Resolves to the first socket address of the host.
    pub(crate) fn resolve(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address found for {}", self.host),
                )
            })
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddr {
    type Err = ClientError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let entry = raw.trim();
        if entry.is_empty() {
            return Err(ClientError::config("empty server entry"));
        }

        let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
            // Bracketed IPv6: "[::1]" or "[::1]:11211".
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ClientError::config(format!("unterminated '[' in {:?}", entry)))?;
            let port = match tail {
                "" => None,
                _ => Some(tail.strip_prefix(':').ok_or_else(|| {
                    ClientError::config(format!("unexpected text after ']' in {:?}", entry))
                })?),
            };
            (host, port)
        } else if entry.matches(':').count() > 1 {
            // Bare IPv6 literal, no port.
            (entry, None)
        } else {
            match entry.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (entry, None),
            }
        };

        if host.is_empty() {
            return Err(ClientError::config(format!("missing host in {:?}", entry)));
        }
        let port = match port {
            None => DEFAULT_PORT,
            Some(raw_port) => match raw_port.parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    return Err(ClientError::config(format!(
                        "invalid port {:?} in {:?}",
                        raw_port, entry
                    )))
                }
            },
        };
        Ok(ServerAddr::new(host, port))
    }
}

/// Parses a comma-joined server list.
pub fn parse_server_list(list: &str) -> ClientResult<Vec<ServerAddr>> {
    if list.trim().is_empty() {
        return Err(ClientError::config("server list is empty"));
    }
    list.split(',').map(str::parse).collect()
}

/// Anything accepted as a server list: a comma-joined string or a sequence of
/// individual entries.
pub trait IntoServerList {
    fn into_server_list(self) -> ClientResult<Vec<ServerAddr>>;
}

impl IntoServerList for &str {
    fn into_server_list(self) -> ClientResult<Vec<ServerAddr>> {
        parse_server_list(self)
    }
}

impl IntoServerList for String {
    fn into_server_list(self) -> ClientResult<Vec<ServerAddr>> {
        parse_server_list(&self)
    }
}

impl<S: AsRef<str>> IntoServerList for &[S] {
    fn into_server_list(self) -> ClientResult<Vec<ServerAddr>> {
        if self.is_empty() {
            return Err(ClientError::config("server list is empty"));
        }
        self.iter().map(|entry| entry.as_ref().parse()).collect()
    }
}

impl<S: AsRef<str>> IntoServerList for Vec<S> {
    fn into_server_list(self) -> ClientResult<Vec<ServerAddr>> {
        self.as_slice().into_server_list()
    }
}

impl<S: AsRef<str>, const N: usize> IntoServerList for [S; N] {
    fn into_server_list(self) -> ClientResult<Vec<ServerAddr>> {
        self.as_slice().into_server_list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_forms() {
        let list = parse_server_list("10.0.0.1:11311, cache-b ,[::1]:4000,[fe80::1],::1").unwrap();
        assert_eq!(list[0], ServerAddr::new("10.0.0.1", 11311));
        assert_eq!(list[1], ServerAddr::new("cache-b", DEFAULT_PORT));
        assert_eq!(list[2], ServerAddr::new("::1", 4000));
        assert_eq!(list[3], ServerAddr::new("fe80::1", DEFAULT_PORT));
        assert_eq!(list[4], ServerAddr::new("::1", DEFAULT_PORT));
        assert_eq!(list[2].to_string(), "[::1]:4000");
        assert_eq!(list[0].to_string(), "10.0.0.1:11311");
    }

    #[test]
    fn rejects_malformed_lists() {
        for bad in ["", "  ", "a:1,,b:2", "host:", "host:0", "host:70000", ":11211", "[::1", "[::1]x"] {
            assert!(
                matches!(parse_server_list(bad), Err(ClientError::Config(_))),
                "accepted {:?}",
                bad
            );
        }
        let empty: Vec<String> = Vec::new();
        assert!(matches!(empty.into_server_list(), Err(ClientError::Config(_))));
    }

    #[test]
    fn sequence_entries_are_parsed_individually() {
        let list = ["a:1", "b:2"].into_server_list().unwrap();
        assert_eq!(list, vec![ServerAddr::new("a", 1), ServerAddr::new("b", 2)]);
    }

    #[test]
    fn json_config_uses_defaults() {
        let config = ClientConfig::from_json_str(r#"{"servers": ["a:1"], "io_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.servers, vec!["a:1".to_string()]);
        assert_eq!(config.timeouts().io, Duration::from_millis(250));
        assert_eq!(config.timeouts().connect, Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS));
        assert!(!config.buffering);
    }

    #[test]
    fn json_config_is_validated() {
        assert!(matches!(
            ClientConfig::from_json_str(r#"{"servers": []}"#),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_json_str(r#"{"connect_timeout_ms": 0}"#),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_json_str(r#"{"bogus": 1}"#),
            Err(ClientError::Config(_))
        ));
    }
}
