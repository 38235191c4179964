//! Outermost interceptor: one log line per call with its final outcome.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tonic::{Code, Status};

use super::{CallInfo, Handler, Interceptor};
use crate::session::SessionRole;

/// Logs method, call kind, final status code and elapsed time.
///
/// For a stream the elapsed time covers establishment only.
#[derive(Clone, Copy, Debug)]
pub struct CallLogger {
    role: SessionRole,
}

impl CallLogger {
    pub fn new(role: SessionRole) -> Self {
        Self { role }
    }

    /// Boxed for registration in a [`Chain`](super::Chain).
    pub fn boxed<C, R>(role: SessionRole) -> Arc<dyn Interceptor<C, R>>
    where
        C: CallInfo + Send + 'static,
        R: Send + 'static,
    {
        Arc::new(Self::new(role))
    }
}

impl<C, R> Interceptor<C, R> for CallLogger
where
    C: CallInfo + Send + 'static,
    R: Send + 'static,
{
    fn intercept(&self, call: C, next: Handler<C, R>) -> BoxFuture<'static, Result<R, Status>> {
        let role = self.role;
        let method = call.method().to_owned();
        let kind = call.kind();

        async move {
            let started = Instant::now();
            let result = next(call).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &result {
                Ok(_) => tracing::info!(
                    role = %role,
                    method = %method,
                    kind = %kind,
                    code = ?Code::Ok,
                    elapsed_ms,
                    "rpc call",
                ),
                Err(status) => tracing::warn!(
                    role = %role,
                    method = %method,
                    kind = %kind,
                    code = ?status.code(),
                    detail = status.message(),
                    elapsed_ms,
                    "rpc call failed",
                ),
            }
            result
        }
        .boxed()
    }
}
