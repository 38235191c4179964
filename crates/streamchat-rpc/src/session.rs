//! Stream session lifecycle.
//!
//! A session owns one bidirectional stream from establishment to
//! close and runs two loops over it:
//!
//! - **inbound**: receive → dispatch → (optional reply), until peer EOF,
//!   a fatal receive error, or cancellation;
//! - **outbound**: one produced message per tick, until cancellation or
//!   the producer runs dry.
//!
//! # State machine
//!
//! ```text
//! Establishing ──open ok──▶ Active ──cancel──▶ Draining ──loops joined / deadline──▶ Closed
//!      │                                                                             ▲
//!      └──────────────── open failed / cancelled during establishment ───────────────┘
//! ```
//!
//! # Shutdown ordering
//!
//! 1. The inbound loop triggers the session-wide [`CancelSignal`] on
//!    every exit path (EOF, receive error, cancellation, panic).
//! 2. The outbound loop stops at the next suspension point; a send
//!    blocked on a full buffer is abandoned, not awaited.
//! 3. On a local, voluntary shutdown the coordinator half-closes the
//!    send direction exactly once, on entering `Draining`.
//! 4. `Closed` is reached once both loops are joined or the drain
//!    deadline elapses, after which the loops are aborted.
//!
//! Receive errors are fatal to the session, send errors are not: a
//! failed send to a dead peer is corroborated by the inbound loop.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};

use streamchat_types::config::SessionConfig;

use crate::cancel::{CancelSignal, CloseReason};
use crate::dispatcher::{CallDispatcher, InboundLogger};
use crate::outbound::{Outbound, OutboundSender};
use crate::source::{BoxSource, MessageProducer};

// ---------------------------------------------------------------------------
// SessionState / SessionRole
// ---------------------------------------------------------------------------

/// Lifecycle state of a stream session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SessionState {
    /// Call is being set up; interceptors have not finished.
    Establishing,
    /// Both loops are running.
    Active,
    /// Shutdown requested; loops are finishing up to the deadline.
    Draining,
    /// Stream released.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Establishing => write!(f, "establishing"),
            Self::Active => write!(f, "active"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Which end of the call this session runs on. Used for log context.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SessionRole {
    Client,
    Server,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

// ---------------------------------------------------------------------------
// State tracking
// ---------------------------------------------------------------------------

/// Single-owner record of state transitions, published through a watch.
struct StateTracker {
    role: SessionRole,
    tx: watch::Sender<SessionState>,
    history: Vec<SessionState>,
}

impl StateTracker {
    fn new(role: SessionRole) -> Self {
        let (tx, _rx) = watch::channel(SessionState::Establishing);
        Self {
            role,
            tx,
            history: vec![SessionState::Establishing],
        }
    }

    fn current(&self) -> SessionState {
        *self.tx.borrow()
    }

    fn enter(&mut self, next: SessionState) {
        let current = self.current();
        if current == next || current == SessionState::Closed {
            return;
        }
        tracing::debug!(role = %self.role, from = %current, to = %next, "session state");
        self.history.push(next);
        self.tx.send_replace(next);
    }
}

impl Drop for StateTracker {
    fn drop(&mut self) {
        // Observers waiting on `closed()` must not hang if a session is
        // dropped half-way.
        self.tx.send_replace(SessionState::Closed);
    }
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Cloneable remote control for a session owned by another task.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    cancel: CancelSignal,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Requests a local, voluntary shutdown.
    ///
    /// Safe to call any number of times from any task; returns `true`
    /// only for the call that actually initiated shutdown.
    pub fn shutdown(&self) -> bool {
        self.cancel.cancel(CloseReason::LocalShutdown)
    }

    /// The session-wide cancellation signal.
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Resolves once the session is `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

// ---------------------------------------------------------------------------
// Establishment
// ---------------------------------------------------------------------------

/// The two directions of a freshly established stream.
pub struct EstablishedStream {
    /// Where peer messages come from.
    pub inbound: BoxSource,
    /// Where our messages go.
    pub outbound: Outbound,
}

/// A session in `Establishing`, before its stream exists.
pub struct PendingSession {
    role: SessionRole,
    config: SessionConfig,
    cancel: CancelSignal,
    state: StateTracker,
}

impl PendingSession {
    /// Creates a standalone pending session and its handle.
    pub fn new(role: SessionRole, config: SessionConfig) -> (Self, SessionHandle) {
        Self::build(role, config, CancelSignal::new())
    }

    /// Creates a pending session that shuts down when `parent` is cancelled.
    pub fn with_parent(
        role: SessionRole,
        config: SessionConfig,
        parent: &CancellationToken,
    ) -> (Self, SessionHandle) {
        Self::build(role, config, CancelSignal::child_of(parent))
    }

    fn build(role: SessionRole, config: SessionConfig, cancel: CancelSignal) -> (Self, SessionHandle) {
        let state = StateTracker::new(role);
        let handle = SessionHandle {
            cancel: cancel.clone(),
            state: state.tx.subscribe(),
        };
        (
            Self {
                role,
                config,
                cancel,
                state,
            },
            handle,
        )
    }

    /// Session tuning this session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Side of the call.
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Awaits `open` and moves to `Active` on success.
    ///
    /// A local shutdown requested while `open` is still pending drops
    /// `open`, moves to `Closed` and returns `Ok(None)`. Any other
    /// failure also moves straight to `Closed` and is returned to the
    /// caller.
    pub async fn establish<F>(mut self, open: F) -> Result<Option<StreamSession>, Status>
    where
        F: Future<Output = Result<EstablishedStream, Status>>,
    {
        let cancel = self.cancel.clone();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            opened = open => Some(opened),
        };

        match opened {
            Some(Ok(stream)) => Ok(Some(self.activate(stream))),
            None if self.cancel.reason() == Some(CloseReason::LocalShutdown) => {
                tracing::info!(role = %self.role, "shut down during establishment");
                self.state.enter(SessionState::Closed);
                Ok(None)
            }
            None => self.fail(Status::cancelled("session cancelled during establishment")),
            Some(Err(status)) => self.fail(status),
        }
    }

    fn fail(mut self, status: Status) -> Result<Option<StreamSession>, Status> {
        self.cancel.cancel(CloseReason::EstablishFailed);
        tracing::warn!(
            role = %self.role,
            code = ?status.code(),
            detail = status.message(),
            "stream establishment failed",
        );
        self.state.enter(SessionState::Closed);
        Err(status)
    }

    /// Moves to `Active` around an already established stream.
    pub fn activate(mut self, stream: EstablishedStream) -> StreamSession {
        self.state.enter(SessionState::Active);
        StreamSession {
            role: self.role,
            config: self.config,
            cancel: self.cancel,
            state: self.state,
            inbound: stream.inbound,
            outbound: stream.outbound,
            dispatcher: Arc::new(InboundLogger),
            producer: None,
        }
    }
}

// ---------------------------------------------------------------------------
// StreamSession
// ---------------------------------------------------------------------------

/// Outcome of a finished session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    /// Side of the call.
    pub role: SessionRole,
    /// Every state entered, in order, starting with `Establishing`.
    pub transitions: Vec<SessionState>,
    /// First recorded reason for leaving `Active`.
    pub reason: CloseReason,
    /// Messages received from the peer.
    pub received: u64,
    /// Dispatcher replies queued for the peer.
    pub replied: u64,
    /// Produced messages queued for the peer.
    pub sent: u64,
    /// Sends that failed because the transport had gone away.
    pub send_failures: u64,
    /// The send direction was half-closed by a voluntary shutdown.
    pub half_closed: bool,
    /// The drain deadline elapsed and the loops were aborted.
    pub deadline_elapsed: bool,
}

/// An `Active` session, ready to [`run`](Self::run).
pub struct StreamSession {
    role: SessionRole,
    config: SessionConfig,
    cancel: CancelSignal,
    state: StateTracker,
    inbound: BoxSource,
    outbound: Outbound,
    dispatcher: Arc<dyn CallDispatcher>,
    producer: Option<Box<dyn MessageProducer>>,
}

impl StreamSession {
    /// Sets the handler for inbound messages (default: log and drop).
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn CallDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Enables the outbound loop, fed by `producer`.
    pub fn with_producer<P: MessageProducer>(mut self, producer: P) -> Self {
        self.producer = Some(Box::new(producer));
        self
    }

    /// A handle observing and controlling this session.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            cancel: self.cancel.clone(),
            state: self.state.tx.subscribe(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    /// Runs both loops to completion and returns once `Closed`.
    pub async fn run(self) -> SessionReport {
        let StreamSession {
            role,
            config,
            cancel,
            mut state,
            inbound,
            outbound,
            dispatcher,
            producer,
        } = self;

        let (sender, mut half_close) = outbound.split();

        let mut inbound_task = tokio::spawn(inbound_loop(
            role,
            inbound,
            dispatcher,
            sender.clone(),
            cancel.clone(),
        ));
        let mut outbound_task = producer.map(|producer| {
            tokio::spawn(outbound_loop(
                role,
                producer,
                config.send_interval(),
                sender.clone(),
                cancel.clone(),
            ))
        });
        // Only the loops hold senders from here on.
        drop(sender);

        tracing::info!(role = %role, "session active");

        cancel.cancelled().await;
        // Pins the reason when only a parent token fired.
        cancel.cancel(CloseReason::LocalShutdown);
        let reason = cancel.reason().unwrap_or(CloseReason::LocalShutdown);

        state.enter(SessionState::Draining);
        tracing::info!(role = %role, %reason, "session draining");

        let half_closed = if reason == CloseReason::LocalShutdown {
            let closed = half_close.close();
            tracing::debug!(role = %role, "send direction half-closed");
            closed
        } else {
            false
        };

        let deadline = config.drain_deadline();
        let drained = tokio::time::timeout(
            deadline,
            join_loops(role, &mut inbound_task, outbound_task.as_mut()),
        )
        .await;

        let (inbound_stats, outbound_stats, deadline_elapsed) = match drained {
            Ok((inbound_stats, outbound_stats)) => (inbound_stats, outbound_stats, false),
            Err(_) => {
                tracing::warn!(
                    role = %role,
                    deadline_ms = deadline.as_millis() as u64,
                    "drain deadline elapsed; tearing session down",
                );
                inbound_task.abort();
                if let Some(task) = &outbound_task {
                    task.abort();
                }
                (InboundStats::default(), OutboundStats::default(), true)
            }
        };

        drop(half_close);
        state.enter(SessionState::Closed);
        tracing::info!(
            role = %role,
            %reason,
            received = inbound_stats.received,
            sent = outbound_stats.sent,
            "session closed",
        );

        SessionReport {
            role,
            transitions: state.history.clone(),
            reason,
            received: inbound_stats.received,
            replied: inbound_stats.replied,
            sent: outbound_stats.sent,
            send_failures: outbound_stats.failed,
            half_closed,
            deadline_elapsed,
        }
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
struct InboundStats {
    received: u64,
    replied: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct OutboundStats {
    sent: u64,
    failed: u64,
}

/// How a receive error relates to this session's own cancellation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ReceiveFailure {
    /// Caused by our own signal; not an error.
    Cancelled,
    /// The peer cancelled its side of the call.
    PeerCancelled,
    /// Anything else: reset connection, protocol error, bad frame.
    Transport,
}

pub(crate) fn classify_receive_error(status: &Status, locally_cancelled: bool) -> ReceiveFailure {
    if locally_cancelled {
        ReceiveFailure::Cancelled
    } else if status.code() == Code::Cancelled {
        ReceiveFailure::PeerCancelled
    } else {
        ReceiveFailure::Transport
    }
}

async fn inbound_loop(
    role: SessionRole,
    mut source: BoxSource,
    dispatcher: Arc<dyn CallDispatcher>,
    sender: OutboundSender,
    cancel: CancelSignal,
) -> InboundStats {
    let _guard = cancel.guard(CloseReason::ReceiveFailed);
    let mut stats = InboundStats::default();

    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(role = %role, "inbound loop observed cancellation");
                cancel.cancel(CloseReason::LocalShutdown);
                break;
            }
            received = source.receive() => received,
        };

        match received {
            Ok(Some(message)) => {
                stats.received += 1;
                match dispatcher.on_message(message).await {
                    Ok(Some(reply)) => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {}
                            sent = sender.send(reply) => match sent {
                                Ok(()) => stats.replied += 1,
                                Err(e) => tracing::warn!(role = %role, %e, "failed to queue reply"),
                            },
                        }
                    }
                    Ok(None) => {}
                    Err(status) => {
                        tracing::error!(
                            role = %role,
                            code = ?status.code(),
                            detail = status.message(),
                            "dispatcher rejected message",
                        );
                        cancel.cancel(CloseReason::DispatchFailed);
                        break;
                    }
                }
            }
            Ok(None) => {
                tracing::info!(role = %role, "peer finished sending");
                cancel.cancel(CloseReason::PeerClosed);
                break;
            }
            Err(status) => {
                match classify_receive_error(&status, cancel.is_cancelled()) {
                    ReceiveFailure::Cancelled => {
                        tracing::debug!(role = %role, "receive interrupted by local cancellation");
                        cancel.cancel(CloseReason::LocalShutdown);
                    }
                    ReceiveFailure::PeerCancelled => {
                        tracing::warn!(role = %role, detail = status.message(), "peer cancelled the stream");
                        cancel.cancel(CloseReason::PeerClosed);
                    }
                    ReceiveFailure::Transport => {
                        tracing::error!(
                            role = %role,
                            code = ?status.code(),
                            detail = status.message(),
                            "failed to receive a message",
                        );
                        cancel.cancel(CloseReason::ReceiveFailed);
                    }
                }
                break;
            }
        }
    }

    stats
}

async fn outbound_loop(
    role: SessionRole,
    mut producer: Box<dyn MessageProducer>,
    period: Duration,
    sender: OutboundSender,
    cancel: CancelSignal,
) -> OutboundStats {
    let mut stats = OutboundStats::default();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(role = %role, "outbound loop observed cancellation");
                break;
            }
            _ = ticker.tick() => {}
        }

        let Some(message) = producer.next_message() else {
            tracing::debug!(role = %role, "producer exhausted; outbound loop done");
            break;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = sender.send(message) => match sent {
                Ok(()) => stats.sent += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::error!(role = %role, %e, "failed to send a message");
                }
            },
        }
    }

    stats
}

async fn join_loops(
    role: SessionRole,
    inbound: &mut JoinHandle<InboundStats>,
    outbound: Option<&mut JoinHandle<OutboundStats>>,
) -> (InboundStats, OutboundStats) {
    let inbound_stats = match inbound.await {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!(role = %role, %e, "inbound loop crashed");
            InboundStats::default()
        }
    };

    let outbound_stats = match outbound {
        Some(task) => match task.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(role = %role, %e, "outbound loop crashed");
                OutboundStats::default()
            }
        },
        None => OutboundStats::default(),
    };

    (inbound_stats, outbound_stats)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
