//! Server and client configuration.
//!
//! Both default to plaintext on `127.0.0.1:50051`; TLS material is
//! handled separately by [`crate::credentials`].

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use streamchat_types::config::SessionConfig;
use streamchat_types::{AccessPolicy, Result, StreamchatError};

/// Default listen / dial address.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:50051";

/// Default connect timeout for clients, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Configuration for [`RpcServer`](crate::server::RpcServer).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to bind. Port `0` picks an ephemeral port.
    pub listen_addr: SocketAddr,

    /// Roles required on every call; empty allows everyone.
    pub policy: AccessPolicy,

    /// Tuning for every stream session the server runs.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            policy: AccessPolicy::allow_all(),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        self.session.validate()
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Configuration for [`RpcClient`](crate::client::RpcClient).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub address: String,

    /// TLS server name; defaults to the host part of `address`.
    pub server_name: Option<String>,

    /// Identity token attached to every call. Empty means none.
    pub token: String,

    /// Upper bound on establishing the connection.
    pub connect_timeout_ms: u64,

    /// Tuning for the client's stream session.
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.into(),
            server_name: None,
            token: String::new(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Splits `address` into host and port.
    pub fn host_port(&self) -> Result<(&str, u16)> {
        let (host, port) = self
            .address
            .rsplit_once(':')
            .ok_or_else(|| StreamchatError::Config {
                reason: format!("address '{}' must be host:port", self.address),
            })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(StreamchatError::Config {
                reason: format!("address '{}' has an empty host", self.address),
            });
        }
        let port = port.parse::<u16>().map_err(|_| StreamchatError::Config {
            reason: format!("address '{}' has an invalid port", self.address),
        })?;
        Ok((host, port))
    }

    /// The name checked against the server certificate.
    pub fn tls_server_name(&self) -> Result<String> {
        match &self.server_name {
            Some(name) => Ok(name.clone()),
            None => Ok(self.host_port()?.0.to_string()),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        self.host_port()?;
        if self.connect_timeout_ms == 0 {
            return Err(StreamchatError::Config {
                reason: "connect_timeout_ms must be greater than 0".into(),
            });
        }
        if let Some(name) = &self.server_name {
            if name.is_empty() {
                return Err(StreamchatError::Config {
                    reason: "server_name must not be empty".into(),
                });
            }
        }
        self.session.validate()
    }
}
