//! Invocation instrumentation: a tracing span per handler call plus
//! `metrics` counters and a duration histogram.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::HandlerInvocation;
use crate::error::HandlerError;

pub const HANDLER_INVOCATIONS: &str = "missive_handler_invocations_total";
pub const HANDLER_DURATION: &str = "missive_handler_duration_seconds";

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Records duration and outcome of every invocation.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<HandlerInvocation> for MetricsService<S>
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
        let handler = invocation.handler.name().to_string();
        let span = info_span!(
            "handler",
            handler = %handler,
            message_type = %invocation.message.descriptor,
            message_id = %invocation.message.message_id,
            immediate_retries = invocation.context.immediate_retries(),
            delayed_retries = invocation.context.delayed_retries(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(invocation);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(()) => "ok",
                    Err(err) => err.kind(),
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);

                metrics::counter!(
                    HANDLER_INVOCATIONS,
                    "handler" => handler.clone(),
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!(HANDLER_DURATION, "handler" => handler)
                    .record(elapsed.as_secs_f64());

                match &result {
                    Ok(()) => tracing::debug!(duration_ms, "handler completed"),
                    Err(err) => {
                        tracing::warn!(duration_ms, error = %err, outcome, "handler failed");
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
