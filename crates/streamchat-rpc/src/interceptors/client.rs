//! Client-side call shapes and the identity-attaching interceptor.

use futures::future::BoxFuture;
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tonic::{Status, Streaming};

use streamchat_types::{Result, StreamchatError};

use super::{CallInfo, CallKind, Handler, Interceptor, AUTHORIZATION_KEY};
use crate::outbound::OutboundStream;
use crate::proto::Message;

/// An outgoing call before it reaches the channel.
pub struct ClientCall {
    /// Full gRPC method path.
    pub method: &'static str,
    /// Outgoing metadata.
    pub metadata: MetadataMap,
    /// Request body.
    pub payload: ClientPayload,
}

/// Request body of a [`ClientCall`].
pub enum ClientPayload {
    Unary(Message),
    /// The outbound direction of a stream about to be opened.
    Streaming(OutboundStream),
}

/// What the channel handed back.
pub enum ClientReply {
    Unary(Message),
    /// The inbound direction of an established stream.
    Streaming(Streaming<Message>),
}

impl ClientCall {
    /// A unary call with empty metadata.
    pub fn unary(method: &'static str, message: Message) -> Self {
        Self {
            method,
            metadata: MetadataMap::new(),
            payload: ClientPayload::Unary(message),
        }
    }

    /// A streaming call with empty metadata.
    pub fn streaming(method: &'static str, outbound: OutboundStream) -> Self {
        Self {
            method,
            metadata: MetadataMap::new(),
            payload: ClientPayload::Streaming(outbound),
        }
    }
}

impl CallInfo for ClientCall {
    fn method(&self) -> &str {
        self.method
    }

    fn kind(&self) -> CallKind {
        match self.payload {
            ClientPayload::Unary(_) => CallKind::Unary,
            ClientPayload::Streaming(_) => CallKind::Streaming,
        }
    }

    fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }
}

// ---------------------------------------------------------------------------
// CallIdentity
// ---------------------------------------------------------------------------

/// The token a connection presents on every call.
///
/// Parsed once into a metadata value. The empty string is valid and
/// means "no credential".
#[derive(Clone, Debug)]
pub struct CallIdentity {
    value: AsciiMetadataValue,
}

impl CallIdentity {
    /// Parses `token` into a metadata value.
    ///
    /// Fails only on characters that cannot travel in an HTTP/2 header.
    pub fn new(token: &str) -> Result<Self> {
        let value = token.parse::<AsciiMetadataValue>().map_err(|_| StreamchatError::Config {
            reason: "identity token contains characters not allowed in metadata".into(),
        })?;
        Ok(Self { value })
    }

    /// The "no credential" identity.
    pub fn anonymous() -> Self {
        Self {
            value: AsciiMetadataValue::from_static(""),
        }
    }

    /// Returns `true` for the empty identity.
    pub fn is_anonymous(&self) -> bool {
        self.value.is_empty()
    }

    /// The value attached to outgoing metadata.
    pub fn value(&self) -> &AsciiMetadataValue {
        &self.value
    }
}

impl Default for CallIdentity {
    fn default() -> Self {
        Self::anonymous()
    }
}

// ---------------------------------------------------------------------------
// AttachIdentity
// ---------------------------------------------------------------------------

/// Appends the connection's [`CallIdentity`] under `authorization`.
#[derive(Clone, Debug)]
pub struct AttachIdentity {
    identity: CallIdentity,
}

impl AttachIdentity {
    pub fn new(identity: CallIdentity) -> Self {
        Self { identity }
    }
}

impl Interceptor<ClientCall, ClientReply> for AttachIdentity {
    fn intercept(
        &self,
        mut call: ClientCall,
        next: Handler<ClientCall, ClientReply>,
    ) -> BoxFuture<'static, std::result::Result<ClientReply, Status>> {
        call.metadata
            .append(AUTHORIZATION_KEY, self.identity.value.clone());
        next(call)
    }
}
