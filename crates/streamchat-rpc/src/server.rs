//! RPC server entry point.
//!
//! [`RpcServer::bind`] validates the configuration, assembles the
//! server interceptor chain and binds the listener; the returned
//! [`BoundServer`] exposes the bound address and a shutdown token
//! before anything is served.
//!
//! # Transports
//!
//! - **Plaintext**: the listener is served directly.
//! - **TLS** (`server-auth` / `mutual`): an accept loop performs each
//!   handshake on its own task and feeds completed streams to tonic.
//!   A failed handshake (including a missing or untrusted client
//!   certificate in mutual mode) drops that connection only.
//!
//! # Graceful shutdown
//!
//! Cancelling the shutdown token stops accepting, drives every live
//! stream session into its voluntary shutdown branch, and waits for
//! them up to the drain deadline.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::Server;

use streamchat_types::{Result, StreamchatError};

use crate::chat_service::ChatService;
use crate::config::ServerConfig;
use crate::credentials::ServerCredential;
use crate::dispatcher::{CallDispatcher, EchoDispatcher};
use crate::interceptors::{
    AcceptNonEmpty, Authorize, CallLogger, Interceptor, ServerCall, ServerReply, TokenValidator,
};
use crate::proto::chat_server::ChatServer;
use crate::session::SessionRole;
use crate::status::transport_error;

/// Completed TLS handshakes waiting for tonic.
const HANDSHAKE_QUEUE: usize = 32;

/// Builder for the gRPC server.
pub struct RpcServer {
    config: ServerConfig,
    credential: ServerCredential,
    validator: Arc<dyn TokenValidator>,
    dispatcher: Arc<dyn CallDispatcher>,
    extra: Vec<Arc<dyn Interceptor<ServerCall, ServerReply>>>,
}

impl RpcServer {
    /// Echo server with the reference token validator.
    pub fn new(config: ServerConfig, credential: ServerCredential) -> Self {
        Self {
            config,
            credential,
            validator: Arc::new(AcceptNonEmpty),
            dispatcher: Arc::new(EchoDispatcher),
            extra: Vec::new(),
        }
    }

    /// Replaces the token validator used by authorization.
    pub fn with_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Replaces the per-message dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn CallDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Registers an interceptor inside authorization.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor<ServerCall, ServerReply>>) -> Self {
        self.extra.push(interceptor);
        self
    }

    /// Binds the listener without serving yet.
    ///
    /// # Errors
    ///
    /// `StreamchatError::Config` for an invalid configuration,
    /// `StreamchatError::Transport` if the address cannot be bound.
    pub async fn bind(self) -> Result<BoundServer> {
        self.config.validate()?;

        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| StreamchatError::Transport {
                reason: format!("failed to bind {}: {e}", self.config.listen_addr),
            })?;
        let local_addr = listener.local_addr().map_err(|e| StreamchatError::Transport {
            reason: format!("failed to read local address: {e}"),
        })?;

        let mut interceptors: Vec<Arc<dyn Interceptor<ServerCall, ServerReply>>> = vec![
            CallLogger::boxed(SessionRole::Server),
            Arc::new(Authorize::with_validator(self.config.policy.clone(), self.validator)),
        ];
        interceptors.extend(self.extra);

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let service = ChatService::new(
            interceptors,
            self.dispatcher,
            self.config.session.clone(),
            shutdown.clone(),
            tracker.clone(),
        );

        tracing::info!(
            addr = %local_addr,
            tls = %self.credential.mode(),
            roles = ?self.config.policy.roles().collect::<Vec<_>>(),
            "RPC server bound",
        );

        Ok(BoundServer {
            listener,
            local_addr,
            credential: self.credential,
            config: self.config,
            service,
            shutdown,
            tracker,
        })
    }
}

/// A bound, not yet serving, server.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    credential: ServerCredential,
    config: ServerConfig,
    service: ChatService,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl BoundServer {
    /// The address actually bound (resolves port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token that stops the server and every session it runs.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves until the shutdown token is cancelled, then drains.
    pub async fn serve(self) -> Result<()> {
        let BoundServer {
            listener,
            local_addr,
            credential,
            config,
            service,
            shutdown,
            tracker,
        } = self;

        let deadline = config.session.drain_deadline();
        let router = Server::builder().add_service(ChatServer::new(service));
        let signal = {
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        };

        tracing::info!(addr = %local_addr, "RPC server listening");

        let serve = async {
            match credential.tls_config() {
                None => router
                    .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
                    .await
                    .map_err(transport_error),
                Some(tls) => {
                    let (tx, rx) = mpsc::channel(HANDSHAKE_QUEUE);
                    let accept = tokio::spawn(accept_loop(
                        listener,
                        TlsAcceptor::from(tls),
                        tx,
                        shutdown.clone(),
                    ));
                    let result = router
                        .serve_with_incoming_shutdown(ReceiverStream::new(rx), signal)
                        .await
                        .map_err(transport_error);
                    accept.abort();
                    result
                }
            }
        };
        tokio::pin!(serve);

        // Connections can outlive their streams; bound the wait once
        // shutdown has begun.
        let result = tokio::select! {
            result = &mut serve => result,
            _ = async {
                shutdown.cancelled().await;
                tokio::time::sleep(deadline).await;
            } => {
                tracing::warn!(deadline_ms = deadline.as_millis() as u64, "connections still open after drain deadline");
                Ok(())
            }
        };

        tracker.close();
        if tokio::time::timeout(deadline, tracker.wait()).await.is_err() {
            tracing::warn!("stream sessions still running after drain deadline");
        }

        tracing::info!(addr = %local_addr, "RPC server stopped");
        result
    }
}

/// Accepts TCP connections and completes TLS handshakes off the accept path.
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<std::io::Result<TlsStream<TcpStream>>>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (tcp, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(%e, "failed to accept connection");
                continue;
            }
        };
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!(%peer, %e, "failed to set TCP_NODELAY");
        }

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match acceptor.accept(tcp).await {
                Ok(tls) => {
                    // The server has stopped if the queue is closed.
                    let _ = tx.send(Ok(tls)).await;
                }
                Err(e) => tracing::warn!(%peer, %e, "TLS handshake failed"),
            }
        });
    }
}
