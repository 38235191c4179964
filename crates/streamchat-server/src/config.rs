//! CLI argument parsing and config file support.
//!
//! The server can be configured via CLI flags, a JSON config file,
//! or a combination of both (CLI overrides config file).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use streamchat_rpc::config::ServerConfig;
use streamchat_types::config::SessionConfig;
use streamchat_types::{AccessPolicy, Result, StreamchatError, TlsMode};

const DEFAULT_PORT: u16 = 50051;
const DEFAULT_ROLE: &str = "user";
const DEFAULT_CERT: &str = "cert/server-cert.pem";
const DEFAULT_KEY: &str = "cert/server-key.pem";
const DEFAULT_CLIENT_CA: &str = "cert/ca-cert.pem";

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// streamchat server: relays every chat message back to its sender.
#[derive(Debug, Parser)]
#[command(name = "streamchat-server", version, about)]
pub struct CliArgs {
    /// IP address to bind (default: 0.0.0.0).
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// TCP port to listen on (default: 50051; 0 picks a free port).
    #[arg(long)]
    pub port: Option<u16>,

    /// Transport security: none, server-auth or mutual.
    #[arg(long, value_name = "MODE")]
    pub tls: Option<TlsMode>,

    /// Server certificate chain (PEM).
    #[arg(long, value_name = "PATH")]
    pub cert: Option<PathBuf>,

    /// Server private key (PEM).
    #[arg(long, value_name = "PATH")]
    pub key: Option<PathBuf>,

    /// CA bundle trusted for client certificates in mutual mode (PEM).
    #[arg(long, value_name = "PATH")]
    pub client_ca: Option<PathBuf>,

    /// Required role; repeat for several (default: user).
    #[arg(long = "role", value_name = "ROLE")]
    pub roles: Vec<String>,

    /// Allow every call, with or without credentials.
    #[arg(long, conflicts_with = "roles")]
    pub allow_all: bool,

    /// Accepted identity token; repeat for several. Without any, every
    /// non-empty token is accepted.
    #[arg(long = "token", value_name = "TOKEN")]
    pub tokens: Vec<String>,

    /// Upper bound on graceful shutdown, in milliseconds.
    #[arg(long, value_name = "MS")]
    pub drain_deadline_ms: Option<u64>,

    /// Load config from a JSON file.
    #[arg(long = "config", value_name = "PATH")]
    pub config_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Config file (JSON)
// ---------------------------------------------------------------------------

/// JSON config file format.
///
/// Example `server.json`:
/// ```json
/// {
///   "bind": "0.0.0.0",
///   "port": 50051,
///   "tls": "mutual",
///   "cert": "cert/server-cert.pem",
///   "key": "cert/server-key.pem",
///   "client_ca": "cert/ca-cert.pem",
///   "roles": ["user"],
///   "session": { "drain_deadline_ms": 5000 }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfigFile {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub tls: Option<TlsMode>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub client_ca: Option<PathBuf>,
    pub roles: Option<Vec<String>>,
    pub tokens: Option<Vec<String>>,
    pub session: Option<SessionConfig>,
}

// ---------------------------------------------------------------------------
// Resolved config (all defaults applied)
// ---------------------------------------------------------------------------

/// Fully resolved server configuration with all defaults applied.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub rpc: ServerConfig,
    pub tls: TlsMode,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub client_ca: PathBuf,
    pub tokens: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            rpc: ServerConfig {
                listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
                policy: AccessPolicy::require([DEFAULT_ROLE]),
                session: SessionConfig::default(),
            },
            tls: TlsMode::None,
            cert: PathBuf::from(DEFAULT_CERT),
            key: PathBuf::from(DEFAULT_KEY),
            client_ca: PathBuf::from(DEFAULT_CLIENT_CA),
            tokens: Vec::new(),
        }
    }
}

impl ServerSettings {
    /// Resolves CLI args, loading the config file first if one is given.
    pub fn resolve(cli: &CliArgs) -> Result<Self> {
        let base = match &cli.config_path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        let settings = base.merge_cli(cli);
        settings.rpc.validate()?;
        Ok(settings)
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| StreamchatError::Config {
            reason: format!("failed to read config file '{}': {e}", path.display()),
        })?;
        let file: ServerConfigFile = serde_json::from_str(&text).map_err(|e| StreamchatError::Config {
            reason: format!("invalid config JSON: {e}"),
        })?;
        Ok(Self::from_file(file))
    }

    /// Applies a parsed config file on top of the defaults.
    pub fn from_file(file: ServerConfigFile) -> Self {
        let defaults = Self::default();
        let listen_addr = SocketAddr::new(
            file.bind.unwrap_or(defaults.rpc.listen_addr.ip()),
            file.port.unwrap_or(defaults.rpc.listen_addr.port()),
        );
        Self {
            rpc: ServerConfig {
                listen_addr,
                policy: file
                    .roles
                    .map(AccessPolicy::require)
                    .unwrap_or(defaults.rpc.policy),
                session: file.session.unwrap_or_default(),
            },
            tls: file.tls.unwrap_or(defaults.tls),
            cert: file.cert.unwrap_or(defaults.cert),
            key: file.key.unwrap_or(defaults.key),
            client_ca: file.client_ca.unwrap_or(defaults.client_ca),
            tokens: file.tokens.unwrap_or_default(),
        }
    }

    /// Merge CLI overrides onto a config-file base.
    pub fn merge_cli(mut self, cli: &CliArgs) -> Self {
        if let Some(ip) = cli.bind {
            self.rpc.listen_addr.set_ip(ip);
        }
        if let Some(port) = cli.port {
            self.rpc.listen_addr.set_port(port);
        }
        if let Some(tls) = cli.tls {
            self.tls = tls;
        }
        if let Some(ref cert) = cli.cert {
            self.cert = cert.clone();
        }
        if let Some(ref key) = cli.key {
            self.key = key.clone();
        }
        if let Some(ref ca) = cli.client_ca {
            self.client_ca = ca.clone();
        }
        if cli.allow_all {
            self.rpc.policy = AccessPolicy::allow_all();
        } else if !cli.roles.is_empty() {
            self.rpc.policy = AccessPolicy::require(cli.roles.iter().cloned());
        }
        if !cli.tokens.is_empty() {
            self.tokens = cli.tokens.clone();
        }
        if let Some(ms) = cli.drain_deadline_ms {
            self.rpc.session.drain_deadline_ms = ms;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
