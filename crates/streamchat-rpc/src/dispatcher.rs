//! Per-message handlers invoked by a session's inbound loop.
//!
//! A dispatcher never touches stream state. It receives one message
//! and optionally returns a reply, which the session queues on its
//! outbound direction.

use tonic::Status;

use crate::proto::Message;

/// Processes one inbound message.
#[tonic::async_trait]
pub trait CallDispatcher: Send + Sync + 'static {
    /// Handles `message`. `Ok(Some(reply))` sends `reply` back to the peer.
    async fn on_message(&self, message: Message) -> Result<Option<Message>, Status>;
}

/// Relays every message back unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoDispatcher;

#[tonic::async_trait]
impl CallDispatcher for EchoDispatcher {
    async fn on_message(&self, message: Message) -> Result<Option<Message>, Status> {
        tracing::info!(body = %message.body, "received message body from client");
        Ok(Some(message))
    }
}

/// Logs what the server sent and replies with nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct InboundLogger;

#[tonic::async_trait]
impl CallDispatcher for InboundLogger {
    async fn on_message(&self, message: Message) -> Result<Option<Message>, Status> {
        tracing::info!(body = %message.body, "got server message");
        Ok(None)
    }
}
