//! gRPC client wrapper.
//!
//! Every call goes through the client [`Chain`]: [`CallLogger`]
//! outermost, then [`AttachIdentity`], then any extra interceptors,
//! then the tonic channel. A stream passes through the chain once,
//! when it is opened.

use std::sync::Arc;

use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Extensions, Request, Status, Streaming};

use streamchat_types::{Result, StreamchatError};

use crate::chat_service::{CHAT_STREAM_METHOD, ECHO_METHOD};
use crate::config::ClientConfig;
use crate::credentials::ClientCredential;
use crate::interceptors::{
    handler, AttachIdentity, CallIdentity, CallLogger, Chain, ClientCall, ClientPayload,
    ClientReply, Handler, Interceptor,
};
use crate::outbound::{Outbound, OutboundStream};
use crate::proto::chat_client::ChatClient;
use crate::proto::Message;
use crate::session::{EstablishedStream, PendingSession, SessionRole, StreamSession};
use crate::status::{status_to_error, transport_error};

/// Client for the `chat.Chat` service.
#[derive(Clone, Debug)]
pub struct RpcClient {
    chain: Chain<ClientCall, ClientReply>,
}

impl RpcClient {
    /// Connects to `config.address` using `credential`.
    ///
    /// # Errors
    ///
    /// `StreamchatError::Config` for an invalid configuration or
    /// identity token, `StreamchatError::Transport` if the connection
    /// or TLS handshake fails.
    pub async fn connect(config: &ClientConfig, credential: &ClientCredential) -> Result<Self> {
        config.validate()?;
        let identity = CallIdentity::new(&config.token)?;

        let endpoint = Endpoint::from_shared(format!("http://{}", config.address))
            .map_err(|e| StreamchatError::Config {
                reason: format!("invalid address '{}': {e}", config.address),
            })?
            .connect_timeout(config.connect_timeout());

        tracing::info!(
            address = %config.address,
            tls = %credential.mode(),
            "connecting to server",
        );

        let channel = match credential.tls_config() {
            None => endpoint.connect().await.map_err(transport_error)?,
            Some(tls) => {
                let server_name = ServerName::try_from(config.tls_server_name()?).map_err(|e| {
                    StreamchatError::Config {
                        reason: format!("invalid TLS server name: {e}"),
                    }
                })?;
                let connector = TlsConnector::from(tls);
                let address = config.address.clone();

                endpoint
                    .connect_with_connector(tower::service_fn(move |_uri: Uri| {
                        let connector = connector.clone();
                        let server_name = server_name.clone();
                        let address = address.clone();
                        async move {
                            let tcp = TcpStream::connect(address.as_str()).await?;
                            tcp.set_nodelay(true)?;
                            let tls = connector.connect(server_name, tcp).await?;
                            Ok::<_, std::io::Error>(TokioIo::new(tls))
                        }
                    }))
                    .await
                    .map_err(transport_error)?
            }
        };

        Ok(Self::from_channel(channel, identity, Vec::new()))
    }

    /// Wraps an existing channel.
    ///
    /// `extra` interceptors run inside identity attachment.
    pub fn from_channel(
        channel: Channel,
        identity: CallIdentity,
        extra: Vec<Arc<dyn Interceptor<ClientCall, ClientReply>>>,
    ) -> Self {
        let mut interceptors: Vec<Arc<dyn Interceptor<ClientCall, ClientReply>>> = vec![
            CallLogger::boxed(SessionRole::Client),
            Arc::new(AttachIdentity::new(identity)),
        ];
        interceptors.extend(extra);

        Self {
            chain: Chain::new(interceptors, endpoint(ChatClient::new(channel))),
        }
    }

    /// Unary echo.
    pub async fn echo(&self, body: impl Into<String>) -> Result<Message> {
        let call = ClientCall::unary(ECHO_METHOD, Message { body: body.into() });
        match self.chain.call(call).await.map_err(status_to_error)? {
            ClientReply::Unary(reply) => Ok(reply),
            ClientReply::Streaming(_) => Err(StreamchatError::Session {
                reason: "unary call produced a stream".into(),
            }),
        }
    }

    /// Opens the bidirectional stream; `outbound` becomes the request.
    ///
    /// Resolves once the server has accepted the stream, so an
    /// authorization rejection surfaces here.
    pub async fn open_stream(&self, outbound: OutboundStream) -> std::result::Result<Streaming<Message>, Status> {
        match self.chain.call(ClientCall::streaming(CHAT_STREAM_METHOD, outbound)).await? {
            ClientReply::Streaming(inbound) => Ok(inbound),
            ClientReply::Unary(_) => Err(Status::internal("streaming call produced a unary reply")),
        }
    }

    /// Establishes `pending` over a new stream.
    ///
    /// A shutdown requested through the session handle while the
    /// stream is being opened aborts establishment and yields `Ok(None)`.
    pub async fn establish(&self, pending: PendingSession) -> Result<Option<StreamSession>> {
        let (outbound, stream) = Outbound::channel(pending.config().outbound_capacity);
        let open = async {
            let inbound = self.open_stream(stream).await?;
            Ok::<_, Status>(EstablishedStream {
                inbound: Box::new(inbound),
                outbound,
            })
        };
        pending.establish(open).await.map_err(status_to_error)
    }
}

fn endpoint(client: ChatClient<Channel>) -> Handler<ClientCall, ClientReply> {
    handler(move |call: ClientCall| {
        let mut client = client.clone();
        async move {
            let ClientCall {
                metadata, payload, ..
            } = call;
            match payload {
                ClientPayload::Unary(message) => {
                    let request = Request::from_parts(metadata, Extensions::default(), message);
                    let reply = client.echo(request).await?;
                    Ok(ClientReply::Unary(reply.into_inner()))
                }
                ClientPayload::Streaming(outbound) => {
                    let request =
                        Request::from_parts(metadata, Extensions::default(), Outgoing(outbound));
                    let inbound = client.chat_stream(request).await?;
                    Ok(ClientReply::Streaming(inbound.into_inner()))
                }
            }
        }
    })
}

/// Concrete wrapper around [`OutboundStream`]; passing the boxed trait
/// object straight to tonic trips a rustc higher-ranked `Send` error.
struct Outgoing(OutboundStream);

impl futures::Stream for Outgoing {
    type Item = Message;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Message>> {
        self.0.as_mut().poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}
