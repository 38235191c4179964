//! Per-call middleware pipelines.
//!
//! An interceptor is a value implementing `(call, next) -> result`. A
//! [`Chain`] is assembled once at setup time by folding the registered
//! interceptors around an endpoint, innermost first, so that:
//!
//! - interceptors run in registration order on the way in;
//! - each one brackets the rest of the chain and observes its result;
//! - the first registered (outermost) sees the final outcome.
//!
//! The same machinery drives both sides. Server calls are
//! [`ServerCall`] → [`ServerReply`], client calls are [`ClientCall`] →
//! [`ClientReply`]. A streaming call passes through the chain once, at
//! establishment; individual messages never do.

pub mod client;
pub mod logging;
pub mod server;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tonic::metadata::MetadataMap;
use tonic::Status;

pub use client::{AttachIdentity, CallIdentity, ClientCall, ClientPayload, ClientReply};
pub use logging::CallLogger;
pub use server::{
    AcceptNonEmpty, Authorize, ServerCall, ServerPayload, ServerReply, StaticTokens,
    TokenValidator,
};

/// Metadata key carrying the caller's identity token.
pub const AUTHORIZATION_KEY: &str = "authorization";

/// Shape of a call as seen by middleware.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CallKind {
    /// One request, one response.
    Unary,
    /// Long-lived bidirectional stream; intercepted at establishment.
    Streaming,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unary => write!(f, "unary"),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

/// What every intercepted call exposes regardless of side.
pub trait CallInfo {
    /// Full gRPC method path, e.g. `/chat.Chat/ChatStream`.
    fn method(&self) -> &str;

    /// Unary or streaming.
    fn kind(&self) -> CallKind;

    /// Call metadata: outgoing on the client, incoming on the server.
    fn metadata(&self) -> &MetadataMap;
}

/// The rest of the chain, as seen by one interceptor.
pub type Handler<C, R> = Arc<dyn Fn(C) -> BoxFuture<'static, Result<R, Status>> + Send + Sync>;

/// One middleware step.
pub trait Interceptor<C, R>: Send + Sync + 'static {
    /// Handles `call`, usually by delegating to `next` at some point.
    fn intercept(&self, call: C, next: Handler<C, R>) -> BoxFuture<'static, Result<R, Status>>;
}

/// An immutable, pre-assembled middleware pipeline.
pub struct Chain<C, R> {
    entry: Handler<C, R>,
    len: usize,
}

impl<C, R> Clone for Chain<C, R> {
    fn clone(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
            len: self.len,
        }
    }
}

impl<C, R> fmt::Debug for Chain<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain").field("interceptors", &self.len).finish()
    }
}

impl<C, R> Chain<C, R>
where
    C: Send + 'static,
    R: Send + 'static,
{
    /// Wraps `endpoint` in `interceptors`; the first element is outermost.
    pub fn new(interceptors: Vec<Arc<dyn Interceptor<C, R>>>, endpoint: Handler<C, R>) -> Self {
        let len = interceptors.len();
        let entry = interceptors
            .into_iter()
            .rev()
            .fold(endpoint, |next, interceptor| -> Handler<C, R> {
                Arc::new(move |call| interceptor.intercept(call, Arc::clone(&next)))
            });
        Self { entry, len }
    }

    /// Number of registered interceptors.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the chain is just the endpoint.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Runs `call` through the whole chain.
    pub async fn call(&self, call: C) -> Result<R, Status> {
        (self.entry)(call).await
    }
}

/// Boxes a closure into a [`Handler`].
pub fn handler<C, R, F, Fut>(f: F) -> Handler<C, R>
where
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<R, Status>> + Send + 'static,
{
    Arc::new(move |call| Box::pin(f(call)))
}
