//! Inbound message sources and outbound message producers.

use std::collections::VecDeque;

use futures::StreamExt;
use tokio::sync::mpsc;
use tonic::{Status, Streaming};

use crate::outbound::OutboundStream;
use crate::proto::Message;

/// Receive half of a stream.
///
/// `Ok(None)` is a clean end-of-stream from the peer.
#[tonic::async_trait]
pub trait MessageSource: Send + 'static {
    /// Waits for the next message.
    async fn receive(&mut self) -> Result<Option<Message>, Status>;
}

/// Boxed, type-erased source.
pub type BoxSource = Box<dyn MessageSource>;

#[tonic::async_trait]
impl MessageSource for Streaming<Message> {
    async fn receive(&mut self) -> Result<Option<Message>, Status> {
        self.message().await
    }
}

/// In-process peers: read what another session's outbound side emits.
#[tonic::async_trait]
impl MessageSource for OutboundStream {
    async fn receive(&mut self) -> Result<Option<Message>, Status> {
        Ok(self.next().await)
    }
}

#[tonic::async_trait]
impl MessageSource for mpsc::Receiver<Result<Message, Status>> {
    async fn receive(&mut self) -> Result<Option<Message>, Status> {
        self.recv().await.transpose()
    }
}

/// Supplies the body of each outbound tick.
///
/// Returning `None` ends the outbound loop; the session keeps
/// receiving until something else terminates it.
pub trait MessageProducer: Send + 'static {
    /// Produces the next message to send.
    fn next_message(&mut self) -> Option<Message>;
}

impl<F> MessageProducer for F
where
    F: FnMut() -> Option<Message> + Send + 'static,
{
    fn next_message(&mut self) -> Option<Message> {
        self()
    }
}

/// Sends a fixed list of bodies in order, then stops.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProducer {
    queue: VecDeque<String>,
}

impl ScriptedProducer {
    /// Creates a producer over `bodies`.
    pub fn new<I, S>(bodies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue: bodies.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of messages still to send.
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl MessageProducer for ScriptedProducer {
    fn next_message(&mut self) -> Option<Message> {
        self.queue.pop_front().map(|body| Message { body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_producer_drains_in_order() {
        let mut producer = ScriptedProducer::new(["a", "b"]);
        assert_eq!(producer.remaining(), 2);
        assert_eq!(producer.next_message().unwrap().body, "a");
        assert_eq!(producer.next_message().unwrap().body, "b");
        assert!(producer.next_message().is_none());
    }

    #[test]
    fn closures_are_producers() {
        let mut n = 0;
        let mut producer = move || {
            n += 1;
            Some(Message {
                body: format!("tick {n}"),
            })
        };
        assert_eq!(MessageProducer::next_message(&mut producer).unwrap().body, "tick 1");
        assert_eq!(MessageProducer::next_message(&mut producer).unwrap().body, "tick 2");
    }

    #[tokio::test]
    async fn channel_source_reports_errors_and_eof() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Ok(Message { body: "hi".into() })).await.unwrap();
        tx.send(Err(Status::unavailable("gone"))).await.unwrap();
        drop(tx);

        assert_eq!(rx.receive().await.unwrap().unwrap().body, "hi");
        assert_eq!(rx.receive().await.unwrap_err().code(), tonic::Code::Unavailable);
        assert!(rx.receive().await.unwrap().is_none());
    }
}
