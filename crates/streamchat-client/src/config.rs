//! CLI argument parsing and config file support.
//!
//! CLI flags override values from the optional JSON config file.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use streamchat_rpc::config::ClientConfig;
use streamchat_types::config::SessionConfig;
use streamchat_types::{Result, StreamchatError, TlsMode};

const DEFAULT_CA: &str = "cert/ca-cert.pem";
const DEFAULT_CERT: &str = "cert/client-cert.pem";
const DEFAULT_KEY: &str = "cert/client-key.pem";

/// streamchat client: streams chat lines to the server and logs the echoes.
#[derive(Debug, Parser)]
#[command(name = "streamchat-client", version, about)]
pub struct CliArgs {
    /// Server address as host:port (default: 127.0.0.1:50051).
    #[arg(long)]
    pub address: Option<String>,

    /// Transport security: none, server-auth or mutual.
    #[arg(long, value_name = "MODE")]
    pub tls: Option<TlsMode>,

    /// CA bundle used to verify the server (PEM).
    #[arg(long, value_name = "PATH")]
    pub ca: Option<PathBuf>,

    /// Client certificate for mutual mode (PEM).
    #[arg(long, value_name = "PATH")]
    pub cert: Option<PathBuf>,

    /// Client private key for mutual mode (PEM).
    #[arg(long, value_name = "PATH")]
    pub key: Option<PathBuf>,

    /// Name checked against the server certificate.
    #[arg(long, value_name = "NAME")]
    pub server_name: Option<String>,

    /// Identity token sent as `authorization` metadata.
    #[arg(long, env = "STREAMCHAT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Milliseconds between outgoing messages.
    #[arg(long, value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// Upper bound on graceful shutdown, in milliseconds.
    #[arg(long, value_name = "MS")]
    pub drain_deadline_ms: Option<u64>,

    /// Send these bodies in order instead of random lines (repeatable).
    #[arg(long = "message", value_name = "BODY")]
    pub messages: Vec<String>,

    /// Stop producing random lines after this many.
    #[arg(long, conflicts_with = "messages")]
    pub count: Option<usize>,

    /// Load config from a JSON file.
    #[arg(long = "config", value_name = "PATH")]
    pub config_path: Option<PathBuf>,
}

/// JSON config file format.
///
/// ```json
/// {
///   "address": "localhost:50051",
///   "tls": "server-auth",
///   "ca": "cert/ca-cert.pem",
///   "token": "s3cret",
///   "session": { "send_interval_ms": 1000 }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientConfigFile {
    pub address: Option<String>,
    pub tls: Option<TlsMode>,
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub server_name: Option<String>,
    pub token: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub messages: Option<Vec<String>>,
    pub session: Option<SessionConfig>,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub rpc: ClientConfig,
    pub tls: TlsMode,
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub messages: Vec<String>,
    pub count: Option<usize>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            rpc: ClientConfig::default(),
            tls: TlsMode::None,
            ca: PathBuf::from(DEFAULT_CA),
            cert: PathBuf::from(DEFAULT_CERT),
            key: PathBuf::from(DEFAULT_KEY),
            messages: Vec::new(),
            count: None,
        }
    }
}

impl ClientSettings {
    /// Resolves CLI args, loading the config file first if one is given.
    pub fn resolve(cli: &CliArgs) -> Result<Self> {
        let base = match &cli.config_path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        let settings = base.merge_cli(cli);
        settings.rpc.validate()?;
        settings.rpc.session.validate()?;
        Ok(settings)
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| StreamchatError::Config {
            reason: format!("failed to read config file '{}': {e}", path.display()),
        })?;
        let file: ClientConfigFile = serde_json::from_str(&text).map_err(|e| StreamchatError::Config {
            reason: format!("invalid config JSON: {e}"),
        })?;
        Ok(Self::from_file(file))
    }

    pub fn from_file(file: ClientConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            rpc: ClientConfig {
                address: file.address.unwrap_or(defaults.rpc.address),
                server_name: file.server_name,
                token: file.token.unwrap_or_default(),
                connect_timeout_ms: file
                    .connect_timeout_ms
                    .unwrap_or(defaults.rpc.connect_timeout_ms),
                session: file.session.unwrap_or_default(),
            },
            tls: file.tls.unwrap_or(defaults.tls),
            ca: file.ca.unwrap_or(defaults.ca),
            cert: file.cert.unwrap_or(defaults.cert),
            key: file.key.unwrap_or(defaults.key),
            messages: file.messages.unwrap_or_default(),
            count: None,
        }
    }

    /// Merge CLI overrides onto a config-file base.
    pub fn merge_cli(mut self, cli: &CliArgs) -> Self {
        if let Some(ref address) = cli.address {
            self.rpc.address = address.clone();
        }
        if let Some(tls) = cli.tls {
            self.tls = tls;
        }
        if let Some(ref ca) = cli.ca {
            self.ca = ca.clone();
        }
        if let Some(ref cert) = cli.cert {
            self.cert = cert.clone();
        }
        if let Some(ref key) = cli.key {
            self.key = key.clone();
        }
        if let Some(ref name) = cli.server_name {
            self.rpc.server_name = Some(name.clone());
        }
        if let Some(ref token) = cli.token {
            self.rpc.token = token.clone();
        }
        if let Some(ms) = cli.interval_ms {
            self.rpc.session.send_interval_ms = ms;
        }
        if let Some(ms) = cli.drain_deadline_ms {
            self.rpc.session.drain_deadline_ms = ms;
        }
        if !cli.messages.is_empty() {
            self.messages = cli.messages.clone();
        }
        if cli.count.is_some() {
            self.count = cli.count;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("streamchat-client").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_target_local_plaintext_server() {
        let settings = ClientSettings::resolve(&parse(&[])).unwrap();
        assert_eq!(settings.rpc.address, "127.0.0.1:50051");
        assert_eq!(settings.tls, TlsMode::None);
        assert_eq!(settings.ca, PathBuf::from("cert/ca-cert.pem"));
        assert!(settings.messages.is_empty());
    }

    #[test]
    fn cli_flags_apply() {
        let settings = ClientSettings::resolve(&parse(&[
            "--address", "localhost:6000", "--tls", "mutual", "--server-name", "chat.local",
            "--token", "abc", "--interval-ms", "100", "--message", "one", "--message", "two",
        ]))
        .unwrap();
        assert_eq!(settings.rpc.address, "localhost:6000");
        assert_eq!(settings.tls, TlsMode::Mutual);
        assert_eq!(settings.rpc.tls_server_name().unwrap(), "chat.local");
        assert_eq!(settings.rpc.token, "abc");
        assert_eq!(settings.rpc.session.send_interval_ms, 100);
        assert_eq!(settings.messages, vec!["one", "two"]);
    }

    #[test]
    fn cli_overrides_file() {
        let file: ClientConfigFile = serde_json::from_str(
            r#"{ "address": "a:1", "token": "from-file", "messages": ["hi"] }"#,
        )
        .unwrap();
        let settings = ClientSettings::from_file(file).merge_cli(&parse(&["--address", "b:2"]));
        assert_eq!(settings.rpc.address, "b:2");
        assert_eq!(settings.rpc.token, "from-file");
        assert_eq!(settings.messages, vec!["hi"]);
    }

    #[test]
    fn count_conflicts_with_messages() {
        let result = CliArgs::try_parse_from(["streamchat-client", "--count", "3", "--message", "x"]);
        assert!(result.is_err());
    }

    #[test]
    fn bad_address_is_rejected() {
        assert!(ClientSettings::resolve(&parse(&["--address", "no-port"])).is_err());
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(ClientSettings::resolve(&parse(&["--interval-ms", "0"])).is_err());
    }
}
