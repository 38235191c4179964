//! Outbound direction of a stream.
//!
//! Every message a session sends goes through one bounded mpsc
//! channel. The transport is the channel's only reader, so the
//! underlying stream never sees two concurrent writers however many
//! loops hold an [`OutboundSender`].
//!
//! The reader side is an [`OutboundStream`]. It ends in one of two ways:
//!
//! - every sender is dropped: queued messages are flushed first;
//! - the [`HalfClose`] fires: the stream ends at once and anything
//!   still queued is discarded.
//!
//! On the client that end-of-stream is the gRPC half-close; on the
//! server it completes the response.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::proto::Message;

/// Stream of messages handed to the transport.
pub type OutboundStream = Pin<Box<dyn Stream<Item = Message> + Send + 'static>>;

/// The send direction of one session: a sender plus its half-close switch.
pub struct Outbound {
    sender: OutboundSender,
    half_close: HalfClose,
}

impl Outbound {
    /// Creates the channel and returns the writer half plus the stream
    /// to hand to the transport.
    pub fn channel(capacity: usize) -> (Self, OutboundStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = oneshot::channel::<()>();

        let closed = async move {
            // A dropped switch is not a close; wait for the senders instead.
            if close_rx.await.is_err() {
                futures::future::pending::<()>().await;
            }
        };
        let stream = ReceiverStream::new(rx).take_until(closed);

        let outbound = Self {
            sender: OutboundSender { tx },
            half_close: HalfClose {
                tx: Some(close_tx),
            },
        };
        (outbound, Box::pin(stream))
    }

    /// Splits into the cloneable sender and the half-close switch.
    pub fn split(self) -> (OutboundSender, HalfClose) {
        (self.sender, self.half_close)
    }
}

/// Cloneable write handle.
#[derive(Clone, Debug)]
pub struct OutboundSender {
    tx: mpsc::Sender<Message>,
}

/// The transport dropped its end of the outbound channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SendError(pub Message);

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "outbound stream is closed")
    }
}

impl std::error::Error for SendError {}

impl OutboundSender {
    /// Queues `message` for the transport, waiting for buffer space.
    pub async fn send(&self, message: Message) -> Result<(), SendError> {
        self.tx
            .send(message)
            .await
            .map_err(|mpsc::error::SendError(m)| SendError(m))
    }

    /// Returns `true` once the transport has stopped reading.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One-shot "I will send no more" switch.
///
/// Dropping it without calling [`close`](Self::close) leaves the
/// stream to end naturally once the last sender is gone.
#[derive(Debug)]
pub struct HalfClose {
    tx: Option<oneshot::Sender<()>>,
}

impl HalfClose {
    /// Ends the outbound stream. Returns `true` the first time only.
    pub fn close(&mut self) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // The transport may already be gone; nothing left to signal.
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Returns `true` once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}
