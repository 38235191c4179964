//! Transport credentials for each [`TlsMode`].
//!
//! | mode          | client holds                   | server holds                         |
//! |---------------|--------------------------------|--------------------------------------|
//! | `none`        | nothing                        | nothing                              |
//! | `server-auth` | roots                          | local cert+key, no client auth       |
//! | `mutual`      | roots + local cert+key, TLS1.3 | local cert+key + client roots, TLS1.3|
//!
//! Construction is all-or-nothing: either every required piece parses
//! and the rustls config is built, or a [`StreamchatError::CredentialLoad`]
//! is returned and nothing is kept. No file is read in `none` mode.
//! Both sides advertise ALPN `h2`.

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, SupportedProtocolVersion};

use streamchat_types::{Result, StreamchatError, TlsMode};

const ALPN_H2: &[u8] = b"h2";

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Lowest TLS version a credential will negotiate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum MinProtocol {
    Tls12,
    Tls13,
}

impl MinProtocol {
    fn for_mode(mode: TlsMode) -> Self {
        match mode {
            TlsMode::Mutual => Self::Tls13,
            TlsMode::None | TlsMode::ServerAuth => Self::Tls12,
        }
    }

    fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            Self::Tls12 => rustls::ALL_VERSIONS,
            Self::Tls13 => TLS13_ONLY,
        }
    }
}

// ---------------------------------------------------------------------------
// PEM loading
// ---------------------------------------------------------------------------

fn load_err(reason: impl Into<String>) -> StreamchatError {
    StreamchatError::CredentialLoad {
        reason: reason.into(),
    }
}

fn read_file(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| load_err(format!("cannot read {what} '{}': {e}", path.display())))
}

fn read_optional(path: Option<&Path>, what: &str) -> Result<Option<Vec<u8>>> {
    path.map(|p| read_file(p, what)).transpose()
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| load_err(format!("malformed {what}: {e}")))?;
    if certs.is_empty() {
        return Err(load_err(format!("{what} contains no certificates")));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| load_err(format!("malformed private key: {e}")))?
        .ok_or_else(|| load_err("private key file contains no key"))
}

fn parse_roots(pem: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(parse_certs(pem, "roots bundle")?);
    if added == 0 {
        return Err(load_err(format!(
            "roots bundle yielded no valid certificates ({ignored} ignored)"
        )));
    }
    Ok(roots)
}

fn require<'a>(pem: Option<&'a [u8]>, mode: TlsMode, what: &str) -> Result<&'a [u8]> {
    pem.ok_or_else(|| load_err(format!("{mode} mode requires {what}")))
}

/// The local certificate chain and key, parsed together.
struct LocalPair {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl LocalPair {
    fn parse(cert: &[u8], key: &[u8]) -> Result<Self> {
        Ok(Self {
            certs: parse_certs(cert, "certificate")?,
            key: parse_key(key)?,
        })
    }
}

// ---------------------------------------------------------------------------
// ClientCredential
// ---------------------------------------------------------------------------

/// What a client presents and trusts when dialing.
#[derive(Clone)]
pub struct ClientCredential {
    mode: TlsMode,
    min_protocol: MinProtocol,
    config: Option<Arc<rustls::ClientConfig>>,
}

impl std::fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredential")
            .field("mode", &self.mode)
            .field("min_protocol", &self.min_protocol)
            .finish_non_exhaustive()
    }
}

impl ClientCredential {
    /// Plaintext HTTP/2.
    pub fn insecure() -> Self {
        Self {
            mode: TlsMode::None,
            min_protocol: MinProtocol::Tls12,
            config: None,
        }
    }

    /// Reads the files `mode` needs and builds the credential.
    pub fn build(
        mode: TlsMode,
        roots: Option<&Path>,
        cert: Option<&Path>,
        key: Option<&Path>,
    ) -> Result<Self> {
        match mode {
            TlsMode::None => Ok(Self::insecure()),
            TlsMode::ServerAuth => {
                let roots = read_optional(roots, "roots bundle")?;
                Self::from_pem(mode, roots.as_deref(), None, None)
            }
            TlsMode::Mutual => {
                let roots = read_optional(roots, "roots bundle")?;
                let cert = read_optional(cert, "certificate")?;
                let key = read_optional(key, "private key")?;
                Self::from_pem(mode, roots.as_deref(), cert.as_deref(), key.as_deref())
            }
        }
    }

    /// Builds the credential from in-memory PEM.
    pub fn from_pem(
        mode: TlsMode,
        roots: Option<&[u8]>,
        cert: Option<&[u8]>,
        key: Option<&[u8]>,
    ) -> Result<Self> {
        if mode == TlsMode::None {
            return Ok(Self::insecure());
        }

        let roots = parse_roots(require(roots, mode, "a roots bundle")?)?;
        let local = match mode {
            TlsMode::Mutual => Some(LocalPair::parse(
                require(cert, mode, "a client certificate")?,
                require(key, mode, "a client private key")?,
            )?),
            _ => None,
        };

        let min_protocol = MinProtocol::for_mode(mode);
        let builder = rustls::ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(min_protocol.versions())
            .map_err(|e| load_err(format!("unsupported protocol versions: {e}")))?
            .with_root_certificates(roots);

        let mut config = match local {
            Some(pair) => builder
                .with_client_auth_cert(pair.certs, pair.key)
                .map_err(|e| load_err(format!("invalid client certificate or key: {e}")))?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(Self {
            mode,
            min_protocol,
            config: Some(Arc::new(config)),
        })
    }

    pub fn mode(&self) -> TlsMode {
        self.mode
    }

    pub fn min_protocol(&self) -> MinProtocol {
        self.min_protocol
    }

    /// `true` when this credential presents a client certificate.
    pub fn has_local_pair(&self) -> bool {
        self.mode == TlsMode::Mutual
    }

    /// The rustls config, or `None` for plaintext.
    pub fn tls_config(&self) -> Option<Arc<rustls::ClientConfig>> {
        self.config.clone()
    }
}

// ---------------------------------------------------------------------------
// ServerCredential
// ---------------------------------------------------------------------------

/// What a server presents and which client certificates it accepts.
#[derive(Clone)]
pub struct ServerCredential {
    mode: TlsMode,
    min_protocol: MinProtocol,
    config: Option<Arc<rustls::ServerConfig>>,
}

impl std::fmt::Debug for ServerCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCredential")
            .field("mode", &self.mode)
            .field("min_protocol", &self.min_protocol)
            .finish_non_exhaustive()
    }
}

impl ServerCredential {
    /// Plaintext HTTP/2.
    pub fn insecure() -> Self {
        Self {
            mode: TlsMode::None,
            min_protocol: MinProtocol::Tls12,
            config: None,
        }
    }

    /// Reads the files `mode` needs and builds the credential.
    ///
    /// `client_roots` is only read in mutual mode.
    pub fn build(
        mode: TlsMode,
        client_roots: Option<&Path>,
        cert: Option<&Path>,
        key: Option<&Path>,
    ) -> Result<Self> {
        if mode == TlsMode::None {
            return Ok(Self::insecure());
        }
        let cert = read_optional(cert, "certificate")?;
        let key = read_optional(key, "private key")?;
        let roots = match mode {
            TlsMode::Mutual => read_optional(client_roots, "client roots bundle")?,
            _ => None,
        };
        Self::from_pem(mode, roots.as_deref(), cert.as_deref(), key.as_deref())
    }

    /// Builds the credential from in-memory PEM.
    pub fn from_pem(
        mode: TlsMode,
        client_roots: Option<&[u8]>,
        cert: Option<&[u8]>,
        key: Option<&[u8]>,
    ) -> Result<Self> {
        if mode == TlsMode::None {
            return Ok(Self::insecure());
        }

        let local = LocalPair::parse(
            require(cert, mode, "a server certificate")?,
            require(key, mode, "a server private key")?,
        )?;
        let roots = match mode {
            TlsMode::Mutual => Some(parse_roots(require(client_roots, mode, "a client roots bundle")?)?),
            _ => None,
        };

        let provider = provider();
        let min_protocol = MinProtocol::for_mode(mode);
        let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(min_protocol.versions())
            .map_err(|e| load_err(format!("unsupported protocol versions: {e}")))?;

        let builder = match roots {
            Some(roots) => {
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .map_err(|e| load_err(format!("cannot build client verifier: {e}")))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder
            .with_single_cert(local.certs, local.key)
            .map_err(|e| load_err(format!("invalid server certificate or key: {e}")))?;
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(Self {
            mode,
            min_protocol,
            config: Some(Arc::new(config)),
        })
    }

    pub fn mode(&self) -> TlsMode {
        self.mode
    }

    pub fn min_protocol(&self) -> MinProtocol {
        self.min_protocol
    }

    /// `true` when connecting clients must present a verified certificate.
    pub fn requires_client_cert(&self) -> bool {
        self.mode == TlsMode::Mutual
    }

    /// The rustls config, or `None` for plaintext.
    pub fn tls_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.config.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
