//! Server-side call shapes and the authorization interceptor.
//!
//! # Decision order
//!
//! 1. Empty [`AccessPolicy`]: allow, credentials or not.
//! 2. No metadata at all: `Unauthenticated`.
//! 3. `authorization` absent or empty: `Unauthenticated`.
//! 4. Otherwise the configured [`TokenValidator`] decides; a rejection
//!    is `PermissionDenied`.
//!
//! A streaming call is authorized once, at establishment, before its
//! first message is read or written.
//!
//! # Validators
//!
//! - [`AcceptNonEmpty`]: any non-empty token passes.
//! - [`StaticTokens`]: allow-list with an optional `Bearer ` prefix,
//!   compared in **constant time**.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tonic::metadata::MetadataMap;
use tonic::Status;

use streamchat_types::AccessPolicy;

use super::{CallInfo, CallKind, Handler, Interceptor, AUTHORIZATION_KEY};
use crate::outbound::OutboundStream;
use crate::proto::Message;
use crate::source::BoxSource;

/// An incoming call after tonic decoded it, before the handler.
pub struct ServerCall {
    /// Full gRPC method path.
    pub method: &'static str,
    /// Incoming metadata.
    pub metadata: MetadataMap,
    /// Request body.
    pub payload: ServerPayload,
}

/// Request body of a [`ServerCall`].
pub enum ServerPayload {
    Unary(Message),
    /// The inbound direction of a freshly opened stream.
    Streaming(BoxSource),
}

/// What the handler produced.
pub enum ServerReply {
    Unary(Message),
    /// The response direction of the stream.
    Streaming(OutboundStream),
}

impl CallInfo for ServerCall {
    fn method(&self) -> &str {
        self.method
    }

    fn kind(&self) -> CallKind {
        match self.payload {
            ServerPayload::Unary(_) => CallKind::Unary,
            ServerPayload::Streaming(_) => CallKind::Streaming,
        }
    }

    fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }
}

// ---------------------------------------------------------------------------
// TokenValidator
// ---------------------------------------------------------------------------

/// Decides whether a presented, non-empty token satisfies a policy.
pub trait TokenValidator: Send + Sync + 'static {
    fn validate(&self, token: &str, policy: &AccessPolicy) -> bool;
}

/// Accepts every non-empty token.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptNonEmpty;

impl TokenValidator for AcceptNonEmpty {
    fn validate(&self, token: &str, _policy: &AccessPolicy) -> bool {
        !token.is_empty()
    }
}

/// Accepts tokens from a fixed allow-list.
///
/// Tokens are stored as raw bytes and compared without early exit.
#[derive(Clone, Debug, Default)]
pub struct StaticTokens {
    tokens: Vec<Vec<u8>>,
}

impl StaticTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|t| t.as_ref().as_bytes().to_vec())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }
}

impl TokenValidator for StaticTokens {
    fn validate(&self, token: &str, _policy: &AccessPolicy) -> bool {
        let provided = strip_bearer(token.as_bytes());
        // Visit every entry so the time taken does not reveal which matched.
        self.tokens
            .iter()
            .fold(false, |found, expected| constant_time_eq(provided, expected) | found)
    }
}

/// Strips an optional, case-insensitive `Bearer ` prefix.
fn strip_bearer(provided: &[u8]) -> &[u8] {
    if provided.len() > 7 && provided[..7].eq_ignore_ascii_case(b"Bearer ") {
        &provided[7..]
    } else {
        provided
    }
}

/// Compares two byte slices in constant time.
///
/// Returns `true` if and only if `a` and `b` are equal in both
/// length and content. The comparison time depends only on the
/// lengths, not on the content.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ---------------------------------------------------------------------------
// Authorize
// ---------------------------------------------------------------------------

/// Rejects calls whose `authorization` token does not satisfy the policy.
#[derive(Clone)]
pub struct Authorize {
    policy: AccessPolicy,
    validator: Arc<dyn TokenValidator>,
}

impl Authorize {
    /// Authorizer with the reference [`AcceptNonEmpty`] validator.
    pub fn new(policy: AccessPolicy) -> Self {
        Self::with_validator(policy, Arc::new(AcceptNonEmpty))
    }

    pub fn with_validator(policy: AccessPolicy, validator: Arc<dyn TokenValidator>) -> Self {
        Self { policy, validator }
    }

    /// The policy this authorizer enforces.
    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Checks `metadata` against the policy.
    pub fn check(&self, metadata: &MetadataMap) -> Result<(), Status> {
        if self.policy.allows_all() {
            return Ok(());
        }

        if metadata.is_empty() {
            return Err(Status::unauthenticated("metadata is not provided"));
        }

        let token = metadata
            .get(AUTHORIZATION_KEY)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Status::unauthenticated("authorization token is not provided"))?;

        if token.is_empty() {
            return Err(Status::unauthenticated("authorization token is not provided"));
        }

        if !self.validator.validate(token, &self.policy) {
            return Err(Status::permission_denied("no permission to access this RPC"));
        }

        Ok(())
    }
}

impl Interceptor<ServerCall, ServerReply> for Authorize {
    fn intercept(
        &self,
        call: ServerCall,
        next: Handler<ServerCall, ServerReply>,
    ) -> BoxFuture<'static, Result<ServerReply, Status>> {
        match self.check(&call.metadata) {
            Ok(()) => next(call),
            Err(status) => {
                tracing::debug!(
                    method = call.method,
                    kind = %call.kind(),
                    code = ?status.code(),
                    "call rejected by authorization",
                );
                futures::future::ready(Err(status)).boxed()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
