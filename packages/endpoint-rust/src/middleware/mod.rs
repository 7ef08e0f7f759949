//! Tower middleware around a single handler invocation.
//!
//! - [`timeout`]: per-invocation timeout, reported as `HandlerError::Timeout`
//! - [`metrics`]: tracing span plus `metrics` counters and duration histogram
//! - [`pipeline`]: the innermost handler service and the composed stack

use std::sync::Arc;

use missive_core::IncomingMessage;

use crate::handler::{HandlerContext, HandlerRef};

pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use metrics::MetricsLayer;
pub use pipeline::{build_handler_pipeline, HandlerPipeline, HandlerService};
pub use timeout::TimeoutLayer;

/// Request type flowing through the handler pipeline: one handler, one message.
#[derive(Clone)]
pub struct HandlerInvocation {
    pub handler: HandlerRef,
    pub message: Arc<IncomingMessage>,
    pub context: HandlerContext,
    pub timeout_ms: u64,
}

impl std::fmt::Debug for HandlerInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerInvocation")
            .field("handler", &self.handler.name())
            .field("message_id", &self.message.message_id)
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_invocation(handler: HandlerRef, timeout_ms: u64) -> HandlerInvocation {
    use std::collections::BTreeMap;

    use missive_core::MessageTypeDescriptor;

    use crate::persistence::InMemorySagaStore;

    HandlerInvocation {
        handler,
        message: Arc::new(IncomingMessage {
            message_id: "m-1".to_string(),
            descriptor: MessageTypeDescriptor::new("Orders.Commands", "PlaceOrderCommand"),
            headers: BTreeMap::new(),
            body: serde_json::json!({}),
        }),
        context: HandlerContext::new(
            Arc::from("Orders"),
            "m-1",
            0,
            0,
            Arc::new(InMemorySagaStore::new()),
        ),
        timeout_ms,
    }
}
