//! Core shared types for the streamchat workspace.
//!
//! Everything that both binaries and the RPC layer need to agree on
//! lives here: the error enum, transport-security modes, access
//! policies and session tuning.

pub mod config;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// TlsMode
// ---------------------------------------------------------------------------

/// Transport-security mode selected on each side of a connection.
///
/// The same three flags are accepted by the client and the server, but
/// they mean slightly different things:
///
/// | mode          | client                                 | server                                   |
/// |---------------|----------------------------------------|------------------------------------------|
/// | `none`        | plaintext HTTP/2                       | plaintext HTTP/2                         |
/// | `server-auth` | trusts a roots bundle                  | presents cert+key, no client cert        |
/// | `mutual`      | roots bundle + own cert+key, TLS 1.3   | cert+key, client cert required, TLS 1.3  |
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    /// No transport encryption.
    #[default]
    None,
    /// Only the server is authenticated.
    ServerAuth,
    /// Both sides present and verify certificates.
    Mutual,
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::ServerAuth => write!(f, "server-auth"),
            Self::Mutual => write!(f, "mutual"),
        }
    }
}

impl FromStr for TlsMode {
    type Err = StreamchatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" | "plaintext" => Ok(Self::None),
            "server-auth" | "server" | "tls" => Ok(Self::ServerAuth),
            "mutual" | "mtls" => Ok(Self::Mutual),
            other => Err(StreamchatError::Config {
                reason: format!(
                    "unknown tls mode '{other}'; expected 'none', 'server-auth' or 'mutual'"
                ),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// AccessPolicy
// ---------------------------------------------------------------------------

/// Role names a caller must hold to use the service.
///
/// An empty policy allows every call, with or without credentials. A
/// non-empty policy requires an `authorization` token on every call and
/// stream establishment.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct AccessPolicy {
    roles: BTreeSet<String>,
}

impl AccessPolicy {
    /// Policy that lets everyone in.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Policy requiring the given roles.
    pub fn require<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roles: roles
                .into_iter()
                .map(Into::into)
                .filter(|r: &String| !r.is_empty())
                .collect(),
        }
    }

    /// Returns `true` when no role is required.
    pub fn allows_all(&self) -> bool {
        self.roles.is_empty()
    }

    /// Iterates the required roles in sorted order.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }

    /// Returns `true` if `role` is one of the required roles.
    pub fn contains(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

impl From<Vec<String>> for AccessPolicy {
    fn from(roles: Vec<String>) -> Self {
        Self::require(roles)
    }
}

impl From<AccessPolicy> for Vec<String> {
    fn from(policy: AccessPolicy) -> Self {
        policy.roles.into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StreamchatError>;

/// Top-level error type for the streamchat workspace.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamchatError {
    /// Certificate material is missing, malformed or inconsistent.
    ///
    /// Fatal at startup; never retried.
    #[error("credential load error: {reason}")]
    CredentialLoad {
        /// What could not be loaded and why.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    Config {
        /// Human-readable description of the configuration problem.
        reason: String,
    },

    /// Connection establishment or an in-flight transport operation failed.
    #[error("transport error: {reason}")]
    Transport {
        /// Human-readable description of the transport failure.
        reason: String,
    },

    /// The call carried no usable credential.
    #[error("unauthenticated: {reason}")]
    Unauthenticated {
        /// Why authentication failed.
        reason: String,
    },

    /// The credential was present but rejected by the access policy.
    #[error("permission denied: {reason}")]
    PermissionDenied {
        /// Why the policy rejected the caller.
        reason: String,
    },

    /// A stream session could not be established or ended abnormally.
    #[error("session error: {reason}")]
    Session {
        /// Human-readable description of the session failure.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_mode_parses_aliases() {
        assert_eq!("none".parse::<TlsMode>().unwrap(), TlsMode::None);
        assert_eq!("server-auth".parse::<TlsMode>().unwrap(), TlsMode::ServerAuth);
        assert_eq!("TLS".parse::<TlsMode>().unwrap(), TlsMode::ServerAuth);
        assert_eq!("mtls".parse::<TlsMode>().unwrap(), TlsMode::Mutual);
    }

    #[test]
    fn tls_mode_rejects_unknown() {
        let err = "quantum".parse::<TlsMode>().unwrap_err();
        assert!(matches!(err, StreamchatError::Config { .. }));
    }

    #[test]
    fn tls_mode_display_round_trips_through_parse() {
        for mode in [TlsMode::None, TlsMode::ServerAuth, TlsMode::Mutual] {
            assert_eq!(mode.to_string().parse::<TlsMode>().unwrap(), mode);
        }
    }

    #[test]
    fn tls_mode_serde_uses_kebab_case() {
        let json = serde_json::to_string(&TlsMode::ServerAuth).unwrap();
        assert_eq!(json, "\"server-auth\"");
    }

    #[test]
    fn empty_policy_allows_all() {
        assert!(AccessPolicy::allow_all().allows_all());
        assert!(AccessPolicy::require(Vec::<String>::new()).allows_all());
    }

    #[test]
    fn policy_drops_blank_roles() {
        let policy = AccessPolicy::require(["", "user"]);
        assert!(!policy.allows_all());
        assert_eq!(policy.roles().collect::<Vec<_>>(), vec!["user"]);
        assert!(policy.contains("user"));
        assert!(!policy.contains("admin"));
    }

    #[test]
    fn policy_deserializes_from_list() {
        let policy: AccessPolicy = serde_json::from_str(r#"["user", "admin"]"#).unwrap();
        assert_eq!(policy.roles().collect::<Vec<_>>(), vec!["admin", "user"]);
    }

    #[test]
    fn deserialized_policy_drops_blank_roles() {
        let policy: AccessPolicy = serde_json::from_str(r#"["", "user", ""]"#).unwrap();
        assert_eq!(policy, AccessPolicy::require(["user"]));

        let blank: AccessPolicy = serde_json::from_str(r#"[""]"#).unwrap();
        assert!(blank.allows_all());
        assert_eq!(serde_json::to_string(&blank).unwrap(), "[]");
    }
}
