//! The handler service and the composed invocation stack.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::{Service, ServiceBuilder};

use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{TimeoutLayer, TimeoutService};
use super::HandlerInvocation;
use crate::error::HandlerError;

/// Innermost service: calls the handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerService;

impl Service<HandlerInvocation> for HandlerService {
    type Response = ();
    type Error = HandlerError;
    type Future = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: HandlerInvocation) -> Self::Future {
        Box::pin(async move {
            invocation
                .handler
                .handle(&invocation.message, &invocation.context)
                .await
        })
    }
}

/// The composed stack returned by [`build_handler_pipeline`].
pub type HandlerPipeline = MetricsService<TimeoutService<HandlerService>>;

/// Wraps [`HandlerService`] with middleware.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer`, so timeouts are recorded with their outcome
/// 2. `TimeoutLayer`
#[must_use]
pub fn build_handler_pipeline() -> HandlerPipeline {
    ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(TimeoutLayer)
        .service(HandlerService)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use missive_core::IncomingMessage;
    use tower::ServiceExt;

    use super::*;
    use crate::handler::handler_fn;
    use crate::middleware::test_invocation;

    #[tokio::test]
    async fn pipeline_invokes_handler_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handler = Arc::new(handler_fn("count", move |_msg: IncomingMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }));

        build_handler_pipeline()
            .oneshot(test_invocation(handler, 1_000))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_enforces_timeout() {
        let handler = Arc::new(handler_fn("hang", |_msg: IncomingMessage| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }));

        let err = build_handler_pipeline()
            .oneshot(test_invocation(handler, 100))
            .await
            .unwrap_err();
        assert_eq!(err, HandlerError::Timeout { timeout_ms: 100 });
    }
}
