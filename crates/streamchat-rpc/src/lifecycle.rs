//! Process-level shutdown wiring.
//!
//! [`LifecycleController::run`] drives a unit of work (a client session
//! or a server) to completion. The first shutdown signal triggers the
//! caller's shutdown action and starts a hard deadline; whichever of
//! "work finished" and "deadline elapsed" comes first ends the run.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::signal;

/// Which process signal requested shutdown.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl+C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "interrupt"),
            Self::Terminate => write!(f, "terminate"),
        }
    }
}

/// Resolves on the first SIGINT or SIGTERM.
///
/// A handler that cannot be installed never fires.
pub async fn shutdown_signal() -> ShutdownSignal {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => ShutdownSignal::Interrupt,
        _ = terminate => ShutdownSignal::Terminate,
    }
}

/// How a [`LifecycleController::run`] ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LifecycleOutcome<T> {
    /// Work finished on its own; no signal arrived.
    Finished(T),
    /// A signal arrived and the work finished within the deadline.
    Drained {
        signal: ShutdownSignal,
        output: T,
    },
    /// A signal arrived and the work was still running at the deadline.
    DeadlineElapsed { signal: ShutdownSignal },
}

impl<T> LifecycleOutcome<T> {
    /// Returns `true` unless the deadline elapsed.
    pub fn is_clean(&self) -> bool {
        !matches!(self, Self::DeadlineElapsed { .. })
    }

    /// The work's output, if it finished.
    pub fn into_output(self) -> Option<T> {
        match self {
            Self::Finished(output) | Self::Drained { output, .. } => Some(output),
            Self::DeadlineElapsed { .. } => None,
        }
    }
}

/// Bounds shutdown of one unit of work by a hard deadline.
#[derive(Clone, Copy, Debug)]
pub struct LifecycleController {
    deadline: Duration,
}

impl LifecycleController {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Runs `work` until it finishes.
    ///
    /// If `signal` resolves first, `on_signal` is invoked once and
    /// `work` gets at most the deadline to finish.
    pub async fn run<W, S, F>(&self, work: W, signal: S, on_signal: F) -> LifecycleOutcome<W::Output>
    where
        W: Future,
        S: Future<Output = ShutdownSignal>,
        F: FnOnce(ShutdownSignal),
    {
        tokio::pin!(work);

        let received = tokio::select! {
            biased;
            output = &mut work => return LifecycleOutcome::Finished(output),
            received = signal => received,
        };

        tracing::info!(signal = %received, "shutdown signal received");
        on_signal(received);

        match tokio::time::timeout(self.deadline, work).await {
            Ok(output) => LifecycleOutcome::Drained {
                signal: received,
                output,
            },
            Err(_) => {
                tracing::warn!(
                    deadline_ms = self.deadline.as_millis() as u64,
                    "shutdown deadline elapsed",
                );
                LifecycleOutcome::DeadlineElapsed { signal: received }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::oneshot;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn finished_work_ignores_pending_signal() {
        let controller = LifecycleController::new(Duration::from_secs(5));
        let outcome = controller
            .run(async { 7 }, std::future::pending(), |_| panic!("no signal expected"))
            .await;
        assert_eq!(outcome, LifecycleOutcome::Finished(7));
    }

    #[tokio::test(start_paused = true)]
    async fn signal_triggers_shutdown_and_work_drains() {
        let controller = LifecycleController::new(Duration::from_secs(5));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut stop_tx = Some(stop_tx);

        let work = async move {
            let _ = stop_rx.await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            "drained"
        };
        let outcome = controller
            .run(work, async { ShutdownSignal::Terminate }, |_| {
                if let Some(tx) = stop_tx.take() {
                    let _ = tx.send(());
                }
            })
            .await;

        assert_eq!(
            outcome,
            LifecycleOutcome::Drained {
                signal: ShutdownSignal::Terminate,
                output: "drained",
            }
        );
        assert!(outcome.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_work_is_bounded_by_deadline() {
        let controller = LifecycleController::new(Duration::from_secs(5));
        let started = Instant::now();
        let outcome = controller
            .run(
                std::future::pending::<()>(),
                async { ShutdownSignal::Interrupt },
                |_| {},
            )
            .await;

        assert_eq!(
            outcome,
            LifecycleOutcome::DeadlineElapsed {
                signal: ShutdownSignal::Interrupt
            }
        );
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert!(outcome.into_output().is_none());
    }
}
