//! gRPC layer for streamchat.
//!
//! Exposes the `chat.Chat` service (unary `Echo` and bidirectional
//! `ChatStream`) over plaintext, server-authenticated TLS or mutual
//! TLS, with per-call interceptor chains on both sides.
//!
//! # Modules
//!
//! - [`credentials`]: rustls configs for each [`TlsMode`](streamchat_types::TlsMode).
//! - [`interceptors`]: call chains, identity attachment, authorization, logging.
//! - [`session`]: the send/receive loops of one stream and their shutdown protocol.
//! - [`dispatcher`]: per-message handlers.
//! - [`lifecycle`]: OS signals and the drain deadline.
//! - [`server`] / [`client`]: transport wiring.

pub mod cancel;
pub mod chat_service;
pub mod client;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod interceptors;
pub mod lifecycle;
pub mod outbound;
pub mod server;
pub mod session;
pub mod source;
pub mod status;

/// Generated protobuf and gRPC code for package `chat`.
pub mod proto {
    tonic::include_proto!("chat");
}

pub use cancel::{CancelSignal, CloseReason};
pub use client::RpcClient;
pub use credentials::{ClientCredential, MinProtocol, ServerCredential};
pub use dispatcher::{CallDispatcher, EchoDispatcher, InboundLogger};
pub use lifecycle::{shutdown_signal, LifecycleController, LifecycleOutcome, ShutdownSignal};
pub use server::{BoundServer, RpcServer};
pub use session::{
    PendingSession, SessionHandle, SessionReport, SessionRole, SessionState, StreamSession,
};
pub use source::{MessageProducer, MessageSource, ScriptedProducer};
