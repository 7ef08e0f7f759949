//! Per-invocation timeout.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};

use super::HandlerInvocation;
use crate::error::HandlerError;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Fails invocations that run longer than their `timeout_ms`.
#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<HandlerInvocation> for TimeoutService<S>
where
    S: Service<HandlerInvocation, Response = (), Error = HandlerError> + Send,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = HandlerError;
    type Future = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: HandlerInvocation) -> Self::Future {
        let timeout_ms = invocation.timeout_ms;
        let fut = self.inner.call(invocation);
        Box::pin(async move {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(HandlerError::Timeout { timeout_ms }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use missive_core::IncomingMessage;
    use tower::ServiceExt;

    use super::*;
    use crate::handler::handler_fn;
    use crate::middleware::{test_invocation, HandlerService};

    fn sleeping(delay_ms: u64) -> crate::handler::HandlerRef {
        Arc::new(handler_fn("sleepy", move |_msg: IncomingMessage| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok(())
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn completes_within_timeout() {
        let svc = TimeoutLayer.layer(HandlerService);
        svc.oneshot(test_invocation(sleeping(10), 1_000))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let svc = TimeoutLayer.layer(HandlerService);
        let err = svc
            .oneshot(test_invocation(sleeping(200), 50))
            .await
            .unwrap_err();
        assert_eq!(err, HandlerError::Timeout { timeout_ms: 50 });
        assert!(err.is_retryable());
    }
}
