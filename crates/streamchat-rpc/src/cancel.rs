//! Session-wide cancellation signal.
//!
//! A [`CancelSignal`] is shared by every task of one stream session.
//! Any task may trigger it, any number of times; the first trigger
//! records the [`CloseReason`] and every later trigger is a no-op.
//! Tasks observe it at each suspension point via
//! [`CancelSignal::cancelled`].

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Why a session left `Active`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CloseReason {
    /// Local, voluntary shutdown (signal, explicit request, parent server).
    LocalShutdown,
    /// The peer finished sending or cancelled its side of the call.
    PeerClosed,
    /// An unrecoverable receive or transport failure.
    ReceiveFailed,
    /// The dispatcher rejected an inbound message.
    DispatchFailed,
    /// The stream was never established.
    EstablishFailed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalShutdown => write!(f, "local_shutdown"),
            Self::PeerClosed => write!(f, "peer_closed"),
            Self::ReceiveFailed => write!(f, "receive_failed"),
            Self::DispatchFailed => write!(f, "dispatch_failed"),
            Self::EstablishFailed => write!(f, "establish_failed"),
        }
    }
}

/// Broadcast, idempotent cancellation shared by one session's tasks.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
}

impl CancelSignal {
    /// Creates a standalone signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a signal that also fires when `parent` is cancelled.
    ///
    /// A parent-triggered cancellation carries no reason of its own and
    /// reads back as [`CloseReason::LocalShutdown`].
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Triggers cancellation. Returns `true` only for the call that
    /// recorded the reason.
    pub fn cancel(&self, reason: CloseReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    /// Returns `true` once any trigger (local or parent) has fired.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has fired.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The recorded reason, or `LocalShutdown` if only a parent fired.
    pub fn reason(&self) -> Option<CloseReason> {
        match self.reason.get() {
            Some(reason) => Some(*reason),
            None if self.token.is_cancelled() => Some(CloseReason::LocalShutdown),
            None => None,
        }
    }

    /// Returns a guard that triggers the signal when dropped.
    ///
    /// Loops hold one so that a panic or abort still cancels the rest
    /// of the session.
    pub fn guard(&self, reason: CloseReason) -> CancelOnDrop {
        CancelOnDrop {
            signal: self.clone(),
            reason,
        }
    }
}

/// Triggers a [`CancelSignal`] on drop.
pub struct CancelOnDrop {
    signal: CancelSignal,
    reason: CloseReason,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.signal.cancel(self.reason);
    }
}
