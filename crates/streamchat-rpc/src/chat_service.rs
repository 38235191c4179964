//! `chat.Chat` service implementation.
//!
//! Every call is handed to the server [`Chain`] before it reaches an
//! endpoint. For `ChatStream` the endpoint starts a server-role
//! [`StreamSession`] on the tracker and returns its outbound direction
//! as the response stream, so the handler returns as soon as the
//! stream is established.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::{Request, Response, Status, Streaming};

use streamchat_types::config::SessionConfig;

use crate::dispatcher::CallDispatcher;
use crate::interceptors::{handler, Chain, Handler, Interceptor, ServerCall, ServerPayload, ServerReply};
use crate::outbound::Outbound;
use crate::proto::chat_server::Chat;
use crate::proto::Message;
use crate::session::{EstablishedStream, PendingSession, SessionRole, StreamSession};

/// Method path of the unary call.
pub const ECHO_METHOD: &str = "/chat.Chat/Echo";

/// Method path of the bidirectional stream.
pub const CHAT_STREAM_METHOD: &str = "/chat.Chat/ChatStream";

/// Response stream handed to tonic.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Message, Status>> + Send + 'static>>;

/// What the streaming endpoint needs to start a session.
#[derive(Clone)]
struct SessionFactory {
    config: SessionConfig,
    dispatcher: Arc<dyn CallDispatcher>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl SessionFactory {
    fn start(&self, inbound: crate::source::BoxSource) -> ServerReply {
        let (outbound, stream) = Outbound::channel(self.config.outbound_capacity);
        let (pending, _handle) =
            PendingSession::with_parent(SessionRole::Server, self.config.clone(), &self.shutdown);
        let session: StreamSession = pending
            .activate(EstablishedStream { inbound, outbound })
            .with_dispatcher(Arc::clone(&self.dispatcher));

        self.tracker.spawn(async move {
            let report = session.run().await;
            tracing::debug!(
                reason = %report.reason,
                received = report.received,
                replied = report.replied,
                deadline_elapsed = report.deadline_elapsed,
                "server session finished",
            );
        });

        ServerReply::Streaming(stream)
    }
}

/// The `chat.Chat` service.
#[derive(Clone)]
pub struct ChatService {
    chain: Chain<ServerCall, ServerReply>,
}

impl ChatService {
    /// Builds the service around `interceptors` (outermost first).
    ///
    /// Sessions are children of `shutdown` and are spawned on `tracker`.
    pub fn new(
        interceptors: Vec<Arc<dyn Interceptor<ServerCall, ServerReply>>>,
        dispatcher: Arc<dyn CallDispatcher>,
        config: SessionConfig,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let factory = SessionFactory {
            config,
            dispatcher,
            shutdown,
            tracker,
        };
        Self {
            chain: Chain::new(interceptors, endpoint(factory)),
        }
    }
}

fn endpoint(factory: SessionFactory) -> Handler<ServerCall, ServerReply> {
    handler(move |call: ServerCall| {
        let factory = factory.clone();
        async move {
            match call.payload {
                ServerPayload::Unary(message) => match factory.dispatcher.on_message(message).await? {
                    Some(reply) => Ok(ServerReply::Unary(reply)),
                    None => Err(Status::internal("dispatcher produced no reply")),
                },
                ServerPayload::Streaming(inbound) => Ok(factory.start(inbound)),
            }
        }
    })
}

#[tonic::async_trait]
impl Chat for ChatService {
    async fn echo(&self, request: Request<Message>) -> Result<Response<Message>, Status> {
        let (metadata, _extensions, message) = request.into_parts();
        let call = ServerCall {
            method: ECHO_METHOD,
            metadata,
            payload: ServerPayload::Unary(message),
        };
        match self.chain.call(call).await? {
            ServerReply::Unary(reply) => Ok(Response::new(reply)),
            ServerReply::Streaming(_) => Err(Status::internal("unary call produced a stream")),
        }
    }

    type ChatStreamStream = ResponseStream;

    async fn chat_stream(
        &self,
        request: Request<Streaming<Message>>,
    ) -> Result<Response<Self::ChatStreamStream>, Status> {
        let (metadata, _extensions, inbound) = request.into_parts();
        let call = ServerCall {
            method: CHAT_STREAM_METHOD,
            metadata,
            payload: ServerPayload::Streaming(Box::new(inbound)),
        };
        match self.chain.call(call).await? {
            ServerReply::Streaming(stream) => {
                let stream: ResponseStream = Box::pin(stream.map(Ok));
                Ok(Response::new(stream))
            }
            ServerReply::Unary(_) => Err(Status::internal("streaming call produced a unary reply")),
        }
    }
}
